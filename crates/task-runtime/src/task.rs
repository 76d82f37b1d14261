// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`AsyncTask`]: a heap-allocated [`Job`] extended with a resume context,
//! atomic status, a task-local value stack, an allocator scratch area, and
//! the trailing fragments.
//!
//! `AsyncTask` itself is a fixed, fourteen-word `#[repr(C)]` header. Rust
//! has no flexible-array-member equivalent, so the trailing fragments are
//! not struct fields. They are extra bytes appended to the same heap
//! allocation, reached through [`AsyncTask::fragment_offsets`] and read back
//! by casting a byte offset from `NonNull<AsyncTask>`, the same technique
//! [`FutureFragment`] uses for its own trailing result storage.

use core::alloc::Layout;
use core::any::TypeId;
use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert_eq;

use crate::task_alloc::TaskAllocator;
use crate::context::AsyncContext;
use crate::future::{FutureFragment, ValueWitness};
use crate::group::GroupChildFragment;
use crate::job::{Job, JobFlags, ResumeTaskFn};
use crate::status::AtomicStatusWord;

/// The trailing fragment present on a child `AsyncTask`
/// (`JobFlags::IS_CHILD_TASK`).
#[repr(C)]
pub struct ChildFragment {
    /// Non-owning: the parent outlives the moment-to-moment lifetime of its
    /// children's `ChildFragment`s.
    parent: NonNull<AsyncTask>,
    /// Link in the parent's child list, threaded from the parent's
    /// `ChildTaskStatusRecord`. Mutated **only** by the parent.
    next_child: UnsafeCell<*mut AsyncTask>,
}

impl ChildFragment {
    #[must_use]
    pub fn new(parent: NonNull<AsyncTask>) -> Self {
        Self {
            parent,
            next_child: UnsafeCell::new(core::ptr::null_mut()),
        }
    }

    #[must_use]
    pub fn parent(&self) -> NonNull<AsyncTask> {
        self.parent
    }

    /// # Safety
    ///
    /// Must be called only by the parent task that owns this child's
    /// lifetime.
    #[must_use]
    pub unsafe fn next_child(&self) -> *mut AsyncTask {
        // Safety: forwarded from the caller.
        unsafe { *self.next_child.get() }
    }

    /// # Safety
    ///
    /// Same as [`Self::next_child`].
    pub unsafe fn set_next_child(&self, next: *mut AsyncTask) {
        // Safety: forwarded from the caller.
        unsafe { *self.next_child.get() = next };
    }
}

/// The offsets of each present trailing fragment within an `AsyncTask`'s
/// allocation, relative to the start of the allocation. Fragments absent
/// from `flags` have no offset. `future` is last and variable-sized; its
/// *offset* depends only on `flags`, but its *size* additionally depends on
/// the future's result type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentOffsets {
    pub child: Option<usize>,
    pub group_child: Option<usize>,
    pub future: Option<usize>,
    /// Offset one past the last fixed-size fragment, i.e. where the
    /// variable-sized future fragment (if any) begins, or the end of the
    /// allocation if there is no future fragment.
    fixed_end: usize,
    align: usize,
}

impl FragmentOffsets {
    /// Computes fragment offsets for a task with `flags`, per the canonical
    /// order `ChildFragment`, `GroupChildFragment`, `FutureFragment`.
    #[must_use]
    pub fn compute(flags: JobFlags) -> Self {
        let mut layout = Layout::new::<AsyncTask>();
        let mut child = None;
        let mut group_child = None;

        if flags.get(JobFlags::IS_CHILD_TASK) {
            let (extended, offset) = layout
                .extend(Layout::new::<ChildFragment>())
                .expect("task fragment layout overflow");
            layout = extended;
            child = Some(offset);
        }
        if flags.get(JobFlags::IS_GROUP_CHILD) {
            let (extended, offset) = layout
                .extend(Layout::new::<GroupChildFragment>())
                .expect("task fragment layout overflow");
            layout = extended;
            group_child = Some(offset);
        }

        let future = if flags.get(JobFlags::IS_FUTURE) {
            // `FutureFragment`'s own `size_of`/`align_of` describe its fixed
            // header; that's enough to place it. Its *total* size (header
            // plus trailing result storage) additionally depends on the
            // result witness, computed later by `total_layout`.
            let (extended, offset) = layout
                .extend(Layout::new::<FutureFragment>())
                .expect("task fragment layout overflow");
            layout = extended;
            Some(offset)
        } else {
            None
        };

        Self {
            child,
            group_child,
            future,
            fixed_end: layout.size(),
            align: layout.align(),
        }
    }

    /// The total allocation size for a task with these offsets, given the
    /// future result witness if `future` is present.
    #[must_use]
    pub fn total_layout(&self, result_type: Option<ValueWitness>) -> Layout {
        match (self.future, result_type) {
            (Some(offset), Some(witness)) => {
                let future_layout = FutureFragment::layout_for(witness);
                let size = offset + future_layout.size();
                Layout::from_size_align(size, self.align.max(future_layout.align()))
                    .expect("task allocation layout overflow")
                    .pad_to_align()
            }
            _ => Layout::from_size_align(self.fixed_end, self.align)
                .expect("task allocation layout overflow")
                .pad_to_align(),
        }
    }
}

/// Fixed ABI header of an asynchronous task. Trailing fragments live beyond
/// `size_of::<AsyncTask>()` bytes in the same allocation; see
/// [`FragmentOffsets`].
#[repr(C)]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
#[cfg_attr(target_pointer_width = "32", repr(align(8)))]
#[cfg_attr(not(any(target_pointer_width = "64", target_pointer_width = "32")), repr(align(4)))]
pub struct AsyncTask {
    job: Job,
    resume_context: UnsafeCell<Option<NonNull<AsyncContext>>>,
    status: AtomicStatusWord,
    /// Strong reference count; the task is destroyed by [`AsyncTask::release`]
    /// when this drops to zero.
    refcount: crate::loom::sync::atomic::AtomicUsize,
    allocator: UnsafeCell<TaskAllocator>,
    /// Head of the task-local binding stack.
    local: UnsafeCell<Option<NonNull<LocalFrame>>>,
    /// Reserved to pad the ABI to fourteen words; a real implementation
    /// would use this for pointer-authentication signing of
    /// `resume_context` on platforms that support it, which is out of
    /// scope here.
    _reserved: [usize; 2],
}

const_assert_eq!(size_of::<AsyncTask>(), 14 * size_of::<usize>());

/// How far into a task's ancestry [`AsyncTask::local_value_get`] is allowed
/// to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InheritPolicy {
    #[default]
    CurrentTaskOnly,
    InheritFromParent,
}

struct LocalFrame {
    parent: Option<NonNull<LocalFrame>>,
    key: TypeId,
    value: NonNull<()>,
    witness: ValueWitness,
}

impl AsyncTask {
    /// Allocates a new task with the given `flags`, initial `resume_context`,
    /// and (if `IS_FUTURE` is set) future result witness.
    ///
    /// # Safety
    ///
    /// If `flags.is_child_task()`, the fragment is left with a dangling
    /// `next_child`; the caller must link it into the parent's child list
    /// (e.g. via a `ChildTaskStatusRecord`, out of scope here) before
    /// publishing the task. If `flags.is_group_child()`, similarly the
    /// caller must call `TaskGroup::register_child`.
    #[must_use]
    pub unsafe fn new(
        flags: JobFlags,
        resume_task: ResumeTaskFn,
        resume_context: NonNull<AsyncContext>,
        child_parent: Option<NonNull<AsyncTask>>,
        group: Option<NonNull<crate::group::TaskGroup>>,
        future_result_type: Option<ValueWitness>,
    ) -> NonNull<AsyncTask> {
        let offsets = FragmentOffsets::compute(flags);
        let layout = offsets.total_layout(future_result_type);

        // Safety: `layout` has non-zero size (it contains at least the
        // fixed `AsyncTask` header).
        let raw = unsafe { alloc::alloc::alloc(layout) };
        let Some(raw) = NonNull::new(raw) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        let task = raw.cast::<AsyncTask>();

        // Safety: `raw` is freshly allocated with room for the fixed header.
        unsafe {
            task.write(AsyncTask {
                job: Job::new_task(flags, resume_task),
                resume_context: UnsafeCell::new(Some(resume_context)),
                status: AtomicStatusWord::new(),
                refcount: crate::loom::sync::atomic::AtomicUsize::new(1),
                allocator: UnsafeCell::new(TaskAllocator::new()),
                local: UnsafeCell::new(None),
                _reserved: [0; 2],
            });
        }

        if let Some(offset) = offsets.child {
            let parent = child_parent.expect("IS_CHILD_TASK requires a parent");
            // Safety: `offset` was computed by `FragmentOffsets::compute`
            // for these exact `flags`, placing `ChildFragment` within the
            // allocation we just made.
            unsafe {
                raw.as_ptr().add(offset).cast::<ChildFragment>().write(ChildFragment::new(parent));
            }
        }
        if let Some(offset) = offsets.group_child {
            let group = group.expect("IS_GROUP_CHILD requires a group");
            // Safety: same reasoning as the child fragment above.
            unsafe {
                raw.as_ptr()
                    .add(offset)
                    .cast::<GroupChildFragment>()
                    .write(GroupChildFragment::new(group));
            }
        }
        if let Some(offset) = offsets.future {
            let witness = future_result_type.expect("IS_FUTURE requires a result witness");
            // Safety: same reasoning; `total_layout` reserved
            // `FutureFragment::layout_for(witness)` bytes starting here.
            unsafe {
                FutureFragment::init(raw.as_ptr().add(offset).cast::<FutureFragment>(), witness);
            }
        }

        tracing::trace!(task = ?task, ?flags, "task allocated");
        task
    }

    /// Raises the strong reference count by one. Pairs with [`Self::release`].
    pub fn retain(&self) {
        self.refcount
            .fetch_add(1, crate::loom::sync::atomic::Ordering::Relaxed);
    }

    #[cfg(test)]
    fn strong_count(&self) -> usize {
        self.refcount.load(crate::loom::sync::atomic::Ordering::Relaxed)
    }

    /// Drops the strong reference count by one, deallocating `task`'s
    /// backing storage once the count reaches zero.
    ///
    /// Task-local values are dropped in LIFO order via the same path
    /// [`Self::local_value_pop`] uses. A completed future's trailing result
    /// value is not dropped here: a caller that writes a type needing
    /// `Drop` into a future's result slot is responsible for reading it out
    /// (e.g. via [`crate::future::FutureFragment::result_ptr`]) before the
    /// last reference to its owning task is released.
    ///
    /// # Safety
    ///
    /// `task` must have been obtained from [`Self::new`] or retained via
    /// [`Self::retain`], and must not be dereferenced again by the caller
    /// after this call returns if it was the last reference.
    pub unsafe fn release(task: NonNull<AsyncTask>) {
        // Safety: forwarded from the caller.
        let this = unsafe { task.as_ref() };
        if this
            .refcount
            .fetch_sub(1, crate::loom::sync::atomic::Ordering::Release)
            != 1
        {
            return;
        }
        crate::loom::sync::atomic::fence(crate::loom::sync::atomic::Ordering::Acquire);
        tracing::trace!(task = ?task, "task released, last reference dropped");

        // Safety: this is the last reference, so no other access to `local`
        // can be racing this one.
        while unsafe { (*this.local.get()).is_some() } {
            // Safety: the loop condition just confirmed a frame is present.
            unsafe { this.local_value_pop() };
        }

        let flags = this.job.flags();
        let offsets = FragmentOffsets::compute(flags);
        let result_witness = offsets.future.map(|_| {
            // Safety: the future fragment was initialized in `Self::new`.
            unsafe { this.future_fragment().as_ref().result_type() }
        });
        let layout = offsets.total_layout(result_witness);

        // Safety: `task` is the last live reference; no code may touch it
        // past this point.
        unsafe {
            core::ptr::drop_in_place(task.as_ptr());
            alloc::alloc::dealloc(task.as_ptr().cast::<u8>(), layout);
        }
    }

    #[must_use]
    pub fn job(&self) -> &Job {
        &self.job
    }

    #[must_use]
    pub fn status(&self) -> &AtomicStatusWord {
        &self.status
    }

    /// Relaxed load of the cancellation flag. Inherently racy.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status.is_cancelled()
    }

    /// The currently installed activation record.
    ///
    /// # Safety
    ///
    /// Must only be called while no other reference to `resume_context` is
    /// being concurrently written (i.e. not mid-suspension-point on another
    /// thread); in practice this is only ever the owning task itself.
    #[must_use]
    pub unsafe fn resume_context(&self) -> NonNull<AsyncContext> {
        // Safety: forwarded from the caller.
        unsafe { (*self.resume_context.get()).expect("task has no installed resume_context") }
    }

    /// Installs a new activation record, returning the previous one.
    ///
    /// # Safety
    ///
    /// Same single-writer requirement as [`Self::resume_context`].
    pub unsafe fn set_resume_context(&self, context: NonNull<AsyncContext>) -> NonNull<AsyncContext> {
        // Safety: forwarded from the caller.
        unsafe {
            (*self.resume_context.get())
                .replace(context)
                .expect("task has no installed resume_context")
        }
    }

    fn offsets(&self) -> FragmentOffsets {
        FragmentOffsets::compute(self.job.flags())
    }

    /// # Panics
    ///
    /// Panics if `JobFlags::IS_CHILD_TASK` is not set.
    #[must_use]
    pub fn child_fragment(&self) -> NonNull<ChildFragment> {
        let offset = self
            .offsets()
            .child
            .expect("child_fragment() called without JobFlags::IS_CHILD_TASK");
        // Safety: `offset` locates the `ChildFragment` written in `Self::new`.
        unsafe { NonNull::from(self).cast::<u8>().add(offset).cast() }
    }

    /// # Panics
    ///
    /// Panics if `JobFlags::IS_GROUP_CHILD` is not set.
    #[must_use]
    pub fn group_child_fragment(&self) -> NonNull<GroupChildFragment> {
        let offset = self
            .offsets()
            .group_child
            .expect("group_child_fragment() called without JobFlags::IS_GROUP_CHILD");
        // Safety: `offset` locates the `GroupChildFragment` written in `Self::new`.
        unsafe { NonNull::from(self).cast::<u8>().add(offset).cast() }
    }

    /// # Panics
    ///
    /// Panics if `JobFlags::IS_FUTURE` is not set.
    #[must_use]
    pub fn future_fragment(&self) -> NonNull<FutureFragment> {
        let offset = self
            .offsets()
            .future
            .expect("future_fragment() called without JobFlags::IS_FUTURE");
        // Safety: `offset` locates the `FutureFragment` written in `Self::new`.
        unsafe { NonNull::from(self).cast::<u8>().add(offset).cast() }
    }

    /// Registers `waiting_task` on this task's future fragment.
    ///
    /// # Safety
    ///
    /// `waiting_task` must point to a live `Job` not already linked into
    /// any other waiter list.
    #[must_use]
    pub unsafe fn wait_future(&self, waiting_task: NonNull<Job>) -> crate::future::FutureStatus {
        // Safety: forwarded from the caller; `future_fragment()` panics if
        // this task is not a future.
        unsafe { self.future_fragment().as_ref().wait_future(waiting_task) }
    }

    /// Prepends a new task-local binding frame.
    ///
    /// # Safety
    ///
    /// Must only be called by the owning task: task-local mutation is not
    /// thread-safe by design.
    pub unsafe fn local_value_push<T: 'static>(&self, value: T) {
        let layout = Layout::new::<LocalFrame>();
        // Safety: this task's own allocator, touched only by the owning
        // task.
        let allocator = unsafe { &mut *self.allocator.get() };
        let storage = allocator.alloc(layout).cast::<LocalFrame>();

        let value_layout = Layout::new::<T>();
        let value_storage = allocator.alloc(value_layout).cast::<T>();
        // Safety: `value_storage` was just allocated with `T`'s layout.
        unsafe { value_storage.write(value) };

        // Safety: `self.local` is only ever touched by the owning task.
        let parent = unsafe { *self.local.get() };
        // Safety: `storage` was just allocated with `LocalFrame`'s layout.
        unsafe {
            storage.write(LocalFrame {
                parent,
                key: TypeId::of::<T>(),
                value: value_storage.cast(),
                witness: ValueWitness::of::<T>(),
            });
        }
        // Safety: same single-writer contract as above.
        unsafe { *self.local.get() = Some(storage) };
    }

    /// Walks the task-local stack for a binding of type `T`, optionally
    /// continuing into the parent task's stack per `policy`.
    ///
    /// # Safety
    ///
    /// Must only be called by the owning task. If `policy` is
    /// `InheritFromParent`, this task must have a `ChildFragment`.
    #[must_use]
    pub unsafe fn local_value_get<T: 'static>(&self, policy: InheritPolicy) -> Option<&T> {
        let key = TypeId::of::<T>();
        // Safety: forwarded from the caller.
        let mut frame = unsafe { *self.local.get() };
        while let Some(f) = frame {
            // Safety: every frame in this chain was written by
            // `local_value_push` and is live for as long as the chain holds it.
            let f_ref = unsafe { f.as_ref() };
            if f_ref.key == key {
                // Safety: `key` matched, so `value` was stored as a `T`.
                return Some(unsafe { f_ref.value.cast::<T>().as_ref() });
            }
            frame = f_ref.parent;
        }

        if policy == InheritPolicy::InheritFromParent && self.job.flags().get(JobFlags::IS_CHILD_TASK) {
            // Safety: `IS_CHILD_TASK` is set, so `child_fragment()` is valid;
            // the parent outlives this task.
            let parent = unsafe { self.child_fragment().as_ref().parent() };
            // Safety: recursing into the parent's own stack under the same
            // contract. Only sound because child-creation happens-before
            // the child's first run, so the parent's stack as of that point
            // is stable to read.
            return unsafe { parent.as_ref().local_value_get::<T>(policy) };
        }

        None
    }

    /// Pops the topmost task-local binding, dropping its value and
    /// reclaiming its storage.
    ///
    /// # Safety
    ///
    /// Must only be called by the owning task, and only when a frame is
    /// actually present.
    pub unsafe fn local_value_pop(&self) {
        // Safety: forwarded from the caller.
        let frame = unsafe { (*self.local.get()).expect("local_value_pop with no frame present") };
        // Safety: `frame` is the live top of the stack.
        let (parent, value, witness) = unsafe {
            let f = frame.as_ref();
            (f.parent, f.value, f.witness)
        };
        // Safety: same single-writer contract as `local_value_push`.
        unsafe { *self.local.get() = parent };

        // Safety: this task's own allocator; `value` and `frame` were the
        // two most recent allocations, in that order, so deallocating
        // `value` then `frame` satisfies the allocator's LIFO contract.
        let allocator = unsafe { &mut *self.allocator.get() };
        // Safety: `witness` describes exactly the type `value` was written
        // with in `local_value_push`.
        unsafe { (witness.drop_in_place())(value.cast()) };
        // Safety: `value` was the most recent allocation at the time it was made.
        unsafe { allocator.dealloc(value.cast()) };
        // Safety: `frame` was allocated immediately before `value`.
        unsafe { allocator.dealloc(frame.cast()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ExecutorRef;

    unsafe fn noop_resume(_task: NonNull<Job>, _exec: ExecutorRef, _ctx: NonNull<AsyncContext>) {}
    unsafe fn noop_resume_parent(_task: NonNull<AsyncTask>, _exec: ExecutorRef, _parent: NonNull<AsyncContext>) {}

    fn dummy_executor() -> ExecutorRef {
        static VTABLE: crate::job::ExecutorVTable = crate::job::ExecutorVTable {
            enqueue: |_, _| {},
        };
        // Safety: the vtable's `enqueue` never dereferences `data`.
        unsafe { ExecutorRef::from_raw(NonNull::dangling(), &VTABLE) }
    }

    fn plain_context() -> NonNull<AsyncContext> {
        let ctx = alloc::boxed::Box::new(AsyncContext::new_ordinary(noop_resume_parent, dummy_executor()));
        NonNull::from(alloc::boxed::Box::leak(ctx))
    }

    #[test]
    fn fragment_offsets_canonical_order() {
        let flags = JobFlags::new()
            .with(JobFlags::IS_CHILD_TASK, true)
            .with(JobFlags::IS_GROUP_CHILD, true)
            .with(JobFlags::IS_FUTURE, true);
        let offsets = FragmentOffsets::compute(flags);
        assert!(offsets.child.unwrap() < offsets.group_child.unwrap());
        assert!(offsets.group_child.unwrap() < offsets.future.unwrap());
    }

    #[test]
    fn abi_shape() {
        assert_eq!(size_of::<AsyncTask>(), 14 * size_of::<usize>());
        assert_eq!(align_of::<AsyncTask>(), 2 * align_of::<usize>());
    }

    #[test]
    fn local_value_push_get_pop_roundtrip() {
        let flags = JobFlags::new();
        // Safety: no fragment flags set, so no fragment args are required.
        let task = unsafe { AsyncTask::new(flags, noop_resume, plain_context(), None, None, None) };
        // Safety: single-threaded test, acting as the owning task.
        unsafe {
            assert_eq!(task.as_ref().local_value_get::<u32>(InheritPolicy::CurrentTaskOnly), None);
            task.as_ref().local_value_push(7u32);
            assert_eq!(
                task.as_ref().local_value_get::<u32>(InheritPolicy::CurrentTaskOnly),
                Some(&7)
            );
            task.as_ref().local_value_pop();
            assert_eq!(task.as_ref().local_value_get::<u32>(InheritPolicy::CurrentTaskOnly), None);
        }
    }

    #[test]
    fn retain_release_track_strong_count() {
        let flags = JobFlags::new();
        // Safety: no fragment flags set, so no fragment args are required.
        let task = unsafe { AsyncTask::new(flags, noop_resume, plain_context(), None, None, None) };
        // Safety: single-threaded test, acting as the owning task.
        unsafe {
            assert_eq!(task.as_ref().strong_count(), 1);
            task.as_ref().retain();
            assert_eq!(task.as_ref().strong_count(), 2);
            AsyncTask::release(task);
            assert_eq!(task.as_ref().strong_count(), 1);
            AsyncTask::release(task);
        }
    }

    #[test]
    fn release_with_outstanding_locals_and_future_fragment_does_not_leak_the_allocator() {
        let flags = JobFlags::new().with(JobFlags::IS_FUTURE, true);
        // Safety: `IS_FUTURE` requires a result witness.
        let task = unsafe {
            AsyncTask::new(
                flags,
                noop_resume,
                plain_context(),
                None,
                None,
                Some(ValueWitness::of::<u64>()),
            )
        };
        // Safety: single-threaded test, acting as the owning task.
        unsafe {
            task.as_ref().local_value_push(1u32);
            task.as_ref().local_value_push(2u32);
            AsyncTask::release(task);
        }
    }
}
