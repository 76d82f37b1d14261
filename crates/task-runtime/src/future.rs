// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`FutureFragment`]: the trailing fragment that makes an [`AsyncTask`] a
//! future. Its `wait_queue` is a single atomic word packing a two-bit
//! [`FutureStatus`] with the head of a singly linked, intrusive waiter list
//! threaded through [`Job::scheduler_private`]'s [`NEXT_WAITING_TASK_INDEX`]
//! slot: a Treiber stack, not a generic intrusive list type, because the
//! ABI pins the exact bit layout.
//!
//! [`AsyncTask`]: crate::task::AsyncTask
//! [`Job::scheduler_private`]: crate::job::Job

use core::alloc::Layout;
use core::any::Any;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::job::{ExecutorRef, Job};
use crate::loom::sync::atomic::AtomicUsize;

const STATUS_BITS: u32 = 2;
const STATUS_MASK: usize = (1 << STATUS_BITS) - 1;
const PTR_MASK: usize = !STATUS_MASK;

/// The three states a future's `wait_queue` can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FutureStatus {
    Executing = 0,
    Success = 1,
    Error = 2,
}

impl FutureStatus {
    const fn from_bits(bits: usize) -> Self {
        match bits & STATUS_MASK {
            0 => Self::Executing,
            1 => Self::Success,
            _ => Self::Error,
        }
    }

    const fn into_bits(self) -> usize {
        self as usize
    }
}

/// A type-erased description of a future's result type: enough to place and
/// later drop the trailing result storage without the core knowing what it
/// is.
#[derive(Clone, Copy)]
pub struct ValueWitness {
    layout: Layout,
    drop_in_place: unsafe fn(NonNull<u8>),
}

impl ValueWitness {
    #[must_use]
    pub const fn of<T>() -> Self {
        Self {
            layout: Layout::new::<T>(),
            drop_in_place: drop_in_place_erased::<T>,
        }
    }

    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.layout
    }

    /// The type-erased drop function for the value this witness describes.
    #[must_use]
    pub const fn drop_in_place(&self) -> unsafe fn(NonNull<u8>) {
        self.drop_in_place
    }
}

/// # Safety
///
/// `ptr` must point at a live, initialized `T` that the caller is giving up
/// ownership of.
unsafe fn drop_in_place_erased<T>(ptr: NonNull<u8>) {
    // Safety: forwarded from the caller.
    unsafe { ptr.cast::<T>().as_ptr().drop_in_place() };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct WaitQueueWord {
    bits: usize,
}

impl WaitQueueWord {
    const fn from_bits(bits: usize) -> Self {
        Self { bits }
    }

    fn status(self) -> FutureStatus {
        FutureStatus::from_bits(self.bits)
    }

    fn head(self) -> Option<NonNull<Job>> {
        NonNull::new((self.bits & PTR_MASK) as *mut Job)
    }

    fn pack(status: FutureStatus, head: Option<NonNull<Job>>) -> Self {
        let ptr_bits = head.map_or(0, |h| h.as_ptr() as usize);
        debug_assert_eq!(ptr_bits & STATUS_MASK, 0, "waiter nodes must be 4-byte aligned");
        Self::from_bits(ptr_bits | status.into_bits())
    }
}

/// The trailing fragment present on an `AsyncTask` with `JobFlags::IS_FUTURE`
/// set. This fragment is variable-sized and must be the last fragment in
/// the tail; its trailing result storage lives immediately after
/// [`core::mem::size_of::<FutureFragment>`] bytes, sized and aligned per
/// `result_type`.
#[repr(C)]
pub struct FutureFragment {
    wait_queue: AtomicUsize,
    result_type: ValueWitness,
    error: UnsafeCell<Option<NonNull<dyn Any>>>,
}

// Safety: all interior mutability here (`wait_queue`, `error`) is guarded by
// the monotonic `Executing -> {Success, Error}` CAS transition: `error` is
// written at most once, by whichever thread wins the CAS in
// `complete_future`, strictly before that CAS is visible to any other
// thread (release on the CAS, acquire on every reader of a non-`Executing`
// status).
unsafe impl Sync for FutureFragment {}

impl FutureFragment {
    /// The layout of a `FutureFragment` plus trailing storage for a result
    /// described by `result_type`, used by [`crate::task`] to compute
    /// fragment offsets within an `AsyncTask`'s allocation.
    #[must_use]
    pub fn layout_for(result_type: ValueWitness) -> Layout {
        let (layout, _offset) = Layout::new::<FutureFragment>()
            .extend(result_type.layout)
            .expect("future result layout overflow");
        layout.pad_to_align()
    }

    /// Writes the fragment's fixed-size header in place. The caller is
    /// responsible for having reserved `Self::layout_for(result_type)` bytes
    /// at `at`.
    ///
    /// # Safety
    ///
    /// `at` must point at live, writable, suitably aligned storage of at
    /// least `Self::layout_for(result_type).size()` bytes.
    pub unsafe fn init(at: NonNull<FutureFragment>, result_type: ValueWitness) {
        // Safety: forwarded from the caller.
        unsafe {
            at.write(FutureFragment {
                wait_queue: AtomicUsize::new(WaitQueueWord::pack(FutureStatus::Executing, None).bits),
                result_type,
                error: UnsafeCell::new(None),
            });
        }
    }

    fn result_offset(&self) -> usize {
        Layout::new::<Self>()
            .extend(self.result_type.layout)
            .expect("future result layout overflow")
            .1
    }

    /// Pointer to the trailing result storage. Valid to read only once
    /// `status()` has observed `Success`.
    #[must_use]
    pub fn result_ptr(&self) -> NonNull<u8> {
        let offset = self.result_offset();
        // Safety: `offset` was computed from the same layout extension used
        // to reserve this fragment's storage in `layout_for`.
        unsafe { NonNull::from(self).cast::<u8>().add(offset) }
    }

    #[must_use]
    pub fn status(&self) -> FutureStatus {
        WaitQueueWord::from_bits(self.wait_queue.load(Ordering::Acquire)).status()
    }

    /// The value witness this fragment was initialized with, needed to
    /// compute its total allocation size when tearing a task down.
    #[must_use]
    pub fn result_type(&self) -> ValueWitness {
        self.result_type
    }

    /// The error payload, once `status()` is `Error`.
    #[must_use]
    pub fn error(&self) -> Option<&dyn Any> {
        // Safety: written at most once under `complete_future`'s CAS, which
        // happens-before this read per the release/acquire pairing on
        // `wait_queue` documented on the `Sync` impl above.
        unsafe { (*self.error.get()).map(|e| e.as_ref()) }
    }

    /// Registers `waiting_task` on this future if it is still `Executing`,
    /// returning the status that was (or became) current.
    ///
    /// # Safety
    ///
    /// `waiting_task` must point to a live `Job` not already linked into any
    /// other waiter list or run-queue.
    pub unsafe fn wait_future(&self, waiting_task: NonNull<Job>) -> FutureStatus {
        loop {
            let current = WaitQueueWord::from_bits(self.wait_queue.load(Ordering::Acquire));
            if current.status() != FutureStatus::Executing {
                return current.status();
            }

            // Safety: `waiting_task` is not linked anywhere else (caller
            // contract), so we may freely write its waiter-list link.
            unsafe { waiting_task.as_ref().set_next_waiter(current.head().map_or(core::ptr::null_mut(), |h| h.as_ptr())) };

            let next = WaitQueueWord::pack(FutureStatus::Executing, Some(waiting_task));
            match self.wait_queue.compare_exchange(
                current.bits,
                next.bits,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::trace!(waiter = ?waiting_task, "registered on future wait queue");
                    return FutureStatus::Executing;
                }
                Err(_) => continue,
            }
        }
    }

    /// Completes this future with a successful result. The caller writes
    /// `value` into the trailing result storage (type-checked by `T` having
    /// to match `result_type`'s layout, asserted in debug builds), then
    /// drains and reschedules every registered waiter onto `executor`.
    ///
    /// # Panics
    ///
    /// Panics if this future has already completed: a second completion
    /// attempt is a programmer error.
    ///
    /// # Safety
    ///
    /// `T`'s layout must match the `result_type` this fragment was
    /// initialized with.
    pub unsafe fn complete_with_value<T>(&self, executor: ExecutorRef, value: T) {
        debug_assert_eq!(Layout::new::<T>(), self.result_type.layout, "result type mismatch");
        // Safety: caller guarantees `T` matches `result_type`, and the
        // monotonicity of the CAS below ensures this write happens at most
        // once, before any reader observes `Success`.
        unsafe { self.result_ptr().cast::<T>().write(value) };
        self.complete(FutureStatus::Success, None, executor);
    }

    /// Completes this future with an error.
    ///
    /// # Panics
    ///
    /// Same as [`Self::complete_with_value`].
    ///
    /// # Safety
    ///
    /// `error` must point at a live value for as long as any waiter might
    /// read it back via [`Self::error`].
    pub unsafe fn complete_with_error(&self, executor: ExecutorRef, error: NonNull<dyn Any>) {
        // Safety: the monotonicity of the CAS in `complete` ensures this
        // write happens at most once, before any reader observes `Error`.
        unsafe { *self.error.get() = Some(error) };
        self.complete(FutureStatus::Error, Some(error), executor);
    }

    fn complete(&self, status: FutureStatus, _error: Option<NonNull<dyn Any>>, executor: ExecutorRef) {
        let mut current = WaitQueueWord::from_bits(self.wait_queue.load(Ordering::Acquire));
        let head = loop {
            assert_eq!(
                current.status(),
                FutureStatus::Executing,
                "future completed twice"
            );
            let next = WaitQueueWord::pack(status, None);
            match self.wait_queue.compare_exchange(
                current.bits,
                next.bits,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break current.head(),
                Err(actual) => current = WaitQueueWord::from_bits(actual),
            }
        };
        tracing::trace!(?status, "future completed");

        // Waiters were pushed at the head (most recent registration first),
        // so draining head-to-tail and enqueueing in that order notifies
        // them in LIFO order of registration, deliberately not fair.
        let mut next = head;
        while let Some(job) = next {
            // Safety: every node in this list was linked by `wait_future`
            // from a live `Job` that has not yet been dequeued.
            let following = unsafe { job.as_ref().next_waiter() };
            tracing::trace!(waiter = ?job, "resuming future waiter");
            // Safety: the executor contract requires `enqueue` to
            // accept ownership of a live, uniquely-owned job; this job was
            // just unlinked from the wait queue and is not enqueued
            // elsewhere.
            unsafe { executor.enqueue(job) };
            next = NonNull::new(following);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use core::mem::MaybeUninit;

    fn dummy_executor_counting(count: &core::cell::Cell<usize>) -> ExecutorRef {
        struct Data<'a>(&'a core::cell::Cell<usize>);
        static VTABLE: crate::job::ExecutorVTable = crate::job::ExecutorVTable {
            enqueue: |data, _job| {
                // Safety: test-only; `data` points at a live `Data` for the
                // duration of the call.
                let data = unsafe { data.cast::<core::cell::Cell<usize>>().as_ref() };
                data.set(data.get() + 1);
            },
        };
        let data = NonNull::from(count).cast::<()>();
        // Safety: `count` outlives the `ExecutorRef` in these tests.
        unsafe { ExecutorRef::from_raw(data, &VTABLE) }
    }

    fn layout_box(result_type: ValueWitness) -> (Box<[MaybeUninit<u8>]>, NonNull<FutureFragment>) {
        let layout = FutureFragment::layout_for(result_type);
        let mut storage = Box::<[u8]>::new_uninit_slice(layout.size());
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap().cast::<FutureFragment>();
        // Safety: `storage` is large enough per `layout_for`.
        unsafe { FutureFragment::init(ptr, result_type) };
        (storage, ptr)
    }

    #[test]
    fn complete_before_wait_returns_immediately() {
        let (_storage, ptr) = layout_box(ValueWitness::of::<u32>());
        // Safety: `ptr` is live for the duration of the test.
        let frag = unsafe { ptr.as_ref() };
        let count = core::cell::Cell::new(0);
        let exec = dummy_executor_counting(&count);
        // Safety: `u32` matches the witness used above.
        unsafe { frag.complete_with_value(exec, 42u32) };
        assert_eq!(frag.status(), FutureStatus::Success);
        // Safety: status is `Success`, so the result is readable.
        assert_eq!(unsafe { frag.result_ptr().cast::<u32>().read() }, 42);
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn double_completion_panics() {
        let (_storage, ptr) = layout_box(ValueWitness::of::<u32>());
        let frag = unsafe { ptr.as_ref() };
        let count = core::cell::Cell::new(0);
        let exec = dummy_executor_counting(&count);
        unsafe { frag.complete_with_value(exec, 1u32) };
        unsafe { frag.complete_with_value(exec, 2u32) };
    }

    struct SendFragPtr(NonNull<FutureFragment>);
    // Safety: test-only; `FutureFragment` is already `Sync` by its own
    // invariant (see the `unsafe impl Sync` above), this just lets the
    // pointer itself cross a thread boundary.
    unsafe impl Send for SendFragPtr {}
    unsafe impl Sync for SendFragPtr {}

    struct SendJobPtr(NonNull<Job>);
    // Safety: test-only; each instance is handed to exactly one thread,
    // which owns it exclusively for the duration of `wait_future`.
    unsafe impl Send for SendJobPtr {}

    unsafe fn noop_run_job(_job: NonNull<Job>, _exec: ExecutorRef) {}

    #[test]
    fn loom_concurrent_wait_future_registrations_all_drained() {
        crate::loom::model(|| {
            let (storage, ptr) = layout_box(ValueWitness::of::<u32>());
            // Safety: leaked so the fragment outlives both threads; this is
            // a test, not production teardown.
            Box::leak(storage);
            let frag_ptr = crate::loom::sync::Arc::new(SendFragPtr(ptr));

            let waiter_a: &'static Job =
                Box::leak(Box::new(Job::new_simple(crate::job::JobFlags::new(), noop_run_job)));
            let waiter_b: &'static Job =
                Box::leak(Box::new(Job::new_simple(crate::job::JobFlags::new(), noop_run_job)));
            let waiter_a_ptr = SendJobPtr(NonNull::from(waiter_a));
            let waiter_b_ptr = SendJobPtr(NonNull::from(waiter_b));

            let frag_ptr2 = crate::loom::sync::Arc::clone(&frag_ptr);
            let t = crate::loom::thread::spawn(move || {
                // Safety: `waiter_b_ptr` is a live `Job` not linked into any
                // other waiter list.
                unsafe { frag_ptr2.0.as_ref().wait_future(waiter_b_ptr.0) };
            });

            // Safety: `waiter_a_ptr` is a live `Job` not linked into any
            // other waiter list, registered concurrently with the spawned
            // thread's registration of `waiter_b_ptr` on the same CAS loop.
            unsafe { frag_ptr.0.as_ref().wait_future(waiter_a_ptr.0) };

            t.join().unwrap();

            let count = core::cell::Cell::new(0);
            let exec = dummy_executor_counting(&count);
            // Safety: `u32` matches the witness this fragment was built with.
            unsafe { frag_ptr.0.as_ref().complete_with_value(exec, 7u32) };

            // Both registrations landed on the wait queue despite racing the
            // same CAS loop; draining on completion must resume both exactly
            // once, regardless of which thread's CAS won first.
            assert_eq!(count.get(), 2);
        });
    }
}
