// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The [`Job`] ABI: the minimal schedulable unit that executors enqueue and
//! run. A [`Job`] is either a one-shot job (resumed via a plain function
//! pointer) or the head of an [`AsyncTask`](crate::task::AsyncTask), resumed
//! through its current [`AsyncContext`](crate::context::AsyncContext).

use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use mycelium_bitfield::bitfield;
use static_assertions::const_assert_eq;

use crate::context::AsyncContext;
use crate::task::AsyncTask;

/// An ordered task priority, lowest to highest.
///
/// Executors are free to interpret priority however they like (this core
/// does not implement preemption or priority inheritance); the ordering
/// itself is the only contract this core guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    Background = 0,
    Utility = 1,
    #[default]
    Default = 2,
    UserInitiated = 3,
    High = 4,
}

impl mycelium_bitfield::FromBits<usize> for Priority {
    type Error = core::convert::Infallible;
    const BITS: u32 = 3;

    fn try_from_bits(bits: usize) -> Result<Self, Self::Error> {
        Ok(match bits {
            0 => Self::Background,
            1 => Self::Utility,
            3 => Self::UserInitiated,
            4 => Self::High,
            _ => Self::Default,
        })
    }

    fn into_bits(self) -> usize {
        self as u8 as usize
    }
}

bitfield! {
    /// Packed descriptor word carried by every [`Job`].
    #[derive(PartialEq, Eq)]
    pub struct JobFlags<usize> {
        /// If set, this job is the head of an [`AsyncTask`], resumed through
        /// a [`AsyncContext`]. If unset, it's a one-shot job resumed via a
        /// plain function pointer.
        pub const IS_ASYNC_TASK: bool;
        /// If set, the owning task has a [`ChildFragment`](crate::task::ChildFragment).
        pub const IS_CHILD_TASK: bool;
        /// If set, the owning task has a [`GroupChildFragment`](crate::task::GroupChildFragment).
        pub const IS_GROUP_CHILD: bool;
        /// If set, the owning task has a [`FutureFragment`](crate::task::FutureFragment).
        pub const IS_FUTURE: bool;
        /// The task's scheduling priority.
        pub const PRIORITY: Priority;
    }
}

bitfield! {
    /// Packed descriptor word carried by every [`AsyncContext`].
    #[derive(PartialEq, Eq)]
    pub struct ContextFlags<usize> {
        /// Which [`AsyncContext`] variant this word's owner actually is.
        pub const KIND: ContextKind;
    }
}

/// The concrete shape of an [`AsyncContext`], selected by `flags.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextKind {
    /// A plain activation record with no extra fields.
    Ordinary = 0,
    /// Adds `yield_to_parent`/`yield_to_parent_executor`.
    Yielding = 1,
    /// Adds an indirect result slot and optional error slot.
    Future = 2,
    /// A [`Future`](ContextKind::Future) that additionally owns a captured closure.
    FutureClosure = 3,
}

impl mycelium_bitfield::FromBits<usize> for ContextKind {
    type Error = core::convert::Infallible;
    const BITS: u32 = 2;

    fn try_from_bits(bits: usize) -> Result<Self, Self::Error> {
        Ok(match bits {
            1 => Self::Yielding,
            2 => Self::Future,
            3 => Self::FutureClosure,
            _ => Self::Ordinary,
        })
    }

    fn into_bits(self) -> usize {
        self as u8 as usize
    }
}

/// An opaque reference to an executor, identified by the caller.
///
/// The executor implementation itself (thread pools, run-queues, priority
/// schedulers) is out of scope for this core; this core only ever needs to
/// compare executor identities and invoke [`ExecutorRef::enqueue`].
#[derive(Clone, Copy)]
pub struct ExecutorRef {
    data: NonNull<()>,
    vtable: &'static ExecutorVTable,
}

/// The inbound contract an executor must implement.
pub struct ExecutorVTable {
    /// Takes ownership of `job` for scheduling. Must eventually invoke
    /// `job.run_in_fully_established_context(self)` on some thread where the
    /// current-executor thread-local has been set to `self`.
    pub enqueue: unsafe fn(data: NonNull<()>, job: NonNull<Job>),
}

impl ExecutorRef {
    /// Constructs an `ExecutorRef` from a type-erased data pointer and its vtable.
    ///
    /// # Safety
    ///
    /// `data` must remain valid for as long as this `ExecutorRef` (or any
    /// copy of it) is used, and `vtable.enqueue` must be safe to call with
    /// it.
    #[must_use]
    pub const unsafe fn from_raw(data: NonNull<()>, vtable: &'static ExecutorVTable) -> Self {
        Self { data, vtable }
    }

    /// Hands `job` off to this executor for scheduling.
    ///
    /// # Safety
    ///
    /// `job` must point to a live, uniquely-owned [`Job`] (or the head of an
    /// [`AsyncTask`]) that is not already enqueued anywhere else.
    pub unsafe fn enqueue(&self, job: NonNull<Job>) {
        // Safety: ensured by caller; `self.data` is valid per `from_raw`'s contract.
        unsafe { (self.vtable.enqueue)(self.data, job) };
    }
}

impl PartialEq for ExecutorRef {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}
impl Eq for ExecutorRef {}

impl core::fmt::Debug for ExecutorRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutorRef").field("data", &self.data).finish()
    }
}

/// A simple, one-shot job's entrypoint: `(self, current_executor)`.
pub type RunJobFn = unsafe fn(NonNull<Job>, ExecutorRef);

/// An [`AsyncTask`]'s entrypoint: `(self, current_executor, resume_context)`.
pub type ResumeTaskFn = unsafe fn(NonNull<Job>, ExecutorRef, NonNull<AsyncContext>);

#[derive(Clone, Copy)]
union Entrypoint {
    run_job: RunJobFn,
    resume_task: ResumeTaskFn,
}

/// Index into [`Job::scheduler_private`] used, by convention of this core,
/// to thread the future wait-queue's singly linked waiter list.
pub const NEXT_WAITING_TASK_INDEX: usize = 0;

/// The minimal schedulable unit. Executors enqueue and run `Job`s; an
/// [`AsyncTask`] embeds one as its first field.
///
/// # ABI invariants
///
/// `size_of::<Job>() == 4 * size_of::<usize>()`,
/// `align_of::<Job>() == 2 * align_of::<usize>()`.
#[repr(C)]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
#[cfg_attr(target_pointer_width = "32", repr(align(8)))]
#[cfg_attr(not(any(target_pointer_width = "64", target_pointer_width = "32")), repr(align(4)))]
pub struct Job {
    /// Opaque to the job itself; used by executors for their intrusive
    /// run-queues, and, by convention, for the waiter-list link
    /// ([`NEXT_WAITING_TASK_INDEX`]) when the job is queued on a future.
    scheduler_private: [AtomicUsize; 2],
    flags: JobFlags,
    entrypoint: Entrypoint,
}

const_assert_eq!(size_of::<Job>(), 4 * size_of::<usize>());

impl Job {
    /// Constructs a one-shot job. `flags.is_async_task()` must be `false`.
    #[must_use]
    pub fn new_simple(mut flags: JobFlags, run_job: RunJobFn) -> Self {
        flags.set(JobFlags::IS_ASYNC_TASK, false);
        Self {
            scheduler_private: [AtomicUsize::new(0), AtomicUsize::new(0)],
            flags,
            entrypoint: Entrypoint { run_job },
        }
    }

    /// Constructs the `Job` head of an [`AsyncTask`]. `flags.is_async_task()`
    /// must be `true`.
    #[must_use]
    pub(crate) fn new_task(mut flags: JobFlags, resume_task: ResumeTaskFn) -> Self {
        flags.set(JobFlags::IS_ASYNC_TASK, true);
        Self {
            scheduler_private: [AtomicUsize::new(0), AtomicUsize::new(0)],
            flags,
            entrypoint: Entrypoint { resume_task },
        }
    }

    #[must_use]
    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    /// Runs this job on the thread currently established as running on
    /// `current_executor`, dispatching to the simple job entrypoint or the
    /// task entrypoint per `flags.is_async_task()`.
    ///
    /// # Safety
    ///
    /// The calling thread must actually be set up as running on
    /// `current_executor`. Callers typically establish this by wrapping the
    /// call in [`crate::enter`].
    /// If `flags.is_async_task()` is set, `self`
    /// must be the first field of a live [`AsyncTask`].
    pub unsafe fn run_in_fully_established_context(&self, current_executor: ExecutorRef) {
        let this = NonNull::from(self);
        if self.flags.get(JobFlags::IS_ASYNC_TASK) {
            // Safety: `flags.is_async_task()` is the caller's guarantee that
            // `self` is the first field of an `AsyncTask` (ABI invariant).
            let task = unsafe { this.cast::<AsyncTask>() };
            let resume_context = unsafe { task.as_ref().resume_context() };
            // Safety: `is_async_task` implies the entrypoint union holds `resume_task`.
            unsafe { (self.entrypoint.resume_task)(this, current_executor, resume_context) };
        } else {
            // Safety: `!is_async_task` implies the entrypoint union holds `run_job`.
            unsafe { (self.entrypoint.run_job)(this, current_executor) };
        }
    }

    /// Reads the waiter-list link at [`NEXT_WAITING_TASK_INDEX`].
    ///
    /// # Safety
    ///
    /// Only valid while this job is queued on (or being registered onto) a
    /// future's wait queue; see [`crate::future`].
    pub(crate) unsafe fn next_waiter(&self) -> *mut Job {
        self.scheduler_private[NEXT_WAITING_TASK_INDEX].load(Ordering::Acquire) as *mut Job
    }

    /// Writes the waiter-list link at [`NEXT_WAITING_TASK_INDEX`].
    ///
    /// # Safety
    ///
    /// Same as [`Self::next_waiter`].
    pub(crate) unsafe fn set_next_waiter(&self, next: *mut Job) {
        self.scheduler_private[NEXT_WAITING_TASK_INDEX].store(next as usize, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_abi_shape() {
        assert_eq!(size_of::<Job>(), 4 * size_of::<usize>());
        assert_eq!(align_of::<Job>(), 2 * align_of::<usize>());
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Background < Priority::Default);
        assert!(Priority::Default < Priority::High);
        assert_eq!(Priority::default(), Priority::Default);
    }
}
