// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`TaskGroup`]: a dynamic collection of child tasks whose
//! completions can be drained in arrival order by a single parent. A
//! group-child's `complete_future` additionally calls [`TaskGroup::offer`],
//! which pushes the finished child onto a Treiber-stack pending queue;
//! [`TaskGroup::next`] pops it, or parks the parent if the queue is
//! momentarily empty.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::job::{ExecutorRef, Job};
use crate::loom::sync::atomic::AtomicUsize;
use crate::task::AsyncTask;

/// The trailing fragment present on a group-child `AsyncTask`
/// (`JobFlags::IS_GROUP_CHILD`).
#[repr(C)]
pub struct GroupChildFragment {
    /// Non-owning: the group outlives its children's membership in it (the
    /// group itself is owned by whichever task spawned the children).
    group: NonNull<TaskGroup>,
    /// Link in the group's full-membership list, mutated only by the task
    /// that owns the group, the same non-owning-child / owning-parent
    /// split as `ChildFragment::next_child`.
    next_sibling: UnsafeCell<*mut AsyncTask>,
    /// Link used only while this task is parked on the group's pending
    /// (completed-but-undrained) stack.
    pending_next: UnsafeCell<*mut AsyncTask>,
}

impl GroupChildFragment {
    #[must_use]
    pub fn new(group: NonNull<TaskGroup>) -> Self {
        Self {
            group,
            next_sibling: UnsafeCell::new(core::ptr::null_mut()),
            pending_next: UnsafeCell::new(core::ptr::null_mut()),
        }
    }

    #[must_use]
    pub fn group(&self) -> NonNull<TaskGroup> {
        self.group
    }
}

/// The outcome of [`TaskGroup::next`].
pub enum GroupPoll {
    /// A completed child is ready; inspect its `future_fragment()`.
    Ready(NonNull<AsyncTask>),
    /// No children are outstanding and none are pending: the group is drained.
    Exhausted,
    /// No completion is ready yet; `waiting_task` has been parked and will
    /// be re-enqueued by a future `offer`.
    Pending,
}

const NONE: usize = 0;

/// A dynamic collection of child tasks. Not part of the `AsyncTask`
/// ABI: owned by whichever task creates it, typically alongside its
/// `ChildFragment`-tracked children.
pub struct TaskGroup {
    /// Head of the full-membership list, threaded through
    /// `GroupChildFragment::next_sibling`. Single-writer: only the owning
    /// task ever calls `register_child`/`cancel`.
    children_head: UnsafeCell<*mut AsyncTask>,
    /// Treiber stack of completed-but-undrained children, threaded through
    /// `GroupChildFragment::pending_next`.
    pending: AtomicUsize,
    /// The parked parent's `Job`, if `next()` found nothing ready. At most
    /// one parent may await a given group at a time.
    parent_waiter: AtomicUsize,
}

// Safety: `children_head` is only ever written by the single task that owns
// this group (documented on the field); `pending` and `parent_waiter` are
// plain tagged words moved only via CAS/swap.
unsafe impl Sync for TaskGroup {}

impl TaskGroup {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            children_head: UnsafeCell::new(core::ptr::null_mut()),
            pending: AtomicUsize::new(NONE),
            parent_waiter: AtomicUsize::new(NONE),
        }
    }

    /// Adds `child` to this group's membership list, prior to its first run.
    ///
    /// # Safety
    ///
    /// `child` must have an initialized `GroupChildFragment` pointing at
    /// this group, and must not already be registered with any group. Must
    /// be called only by the task that owns this group.
    pub unsafe fn register_child(&self, child: NonNull<AsyncTask>) {
        // Safety: forwarded from the caller; single-writer per this
        // group's contract.
        unsafe {
            let frag = child.as_ref().group_child_fragment();
            *frag.as_ref().next_sibling.get() = *self.children_head.get();
            *self.children_head.get() = child.as_ptr();
        }
    }

    fn pop_pending(&self) -> Option<NonNull<AsyncTask>> {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            let head = NonNull::new(current as *mut AsyncTask)?;
            // Safety: `head` is linked on this stack and therefore live.
            let next = unsafe { *head.as_ref().group_child_fragment().as_ref().pending_next.get() };
            match self.pending.compare_exchange(
                current,
                next as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head),
                Err(actual) => current = actual,
            }
        }
    }

    fn push_pending(&self, child: NonNull<AsyncTask>) {
        let mut current = self.pending.load(Ordering::Relaxed);
        loop {
            // Safety: `child` is not yet linked on any pending stack
            // (caller contract of `offer`).
            unsafe {
                *child.as_ref().group_child_fragment().as_ref().pending_next.get() =
                    current as *mut AsyncTask;
            }
            match self.pending.compare_exchange(
                current,
                child.as_ptr() as usize,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn take_parent_waiter(&self) -> Option<NonNull<Job>> {
        let prev = self.parent_waiter.swap(NONE, Ordering::AcqRel);
        NonNull::new(prev as *mut Job)
    }

    fn no_outstanding_children(&self) -> bool {
        // Safety: read-only snapshot; racy with concurrent `register_child`
        // the same way `is_cancelled` is racy. Callers only rely on it once
        // they know no more children will ever be registered.
        unsafe { (*self.children_head.get()).is_null() }
    }

    /// A group-child's `complete_future` calls this in addition to its own
    /// future completion: publishes `child` on the pending stack and, if a
    /// parent is parked, wakes it by enqueuing its job onto `executor`.
    ///
    /// # Safety
    ///
    /// `child` must be a live group-child task belonging to this group,
    /// whose future has just completed, and must not already be on this or
    /// any other pending stack.
    pub unsafe fn offer(&self, child: NonNull<AsyncTask>, executor: ExecutorRef) {
        tracing::trace!(child = ?child, "task group offer");
        self.push_pending(child);
        if let Some(parent) = self.take_parent_waiter() {
            // Safety: `parent` was registered by `next()` as a live job not
            // enqueued elsewhere, and is being handed to `executor` exactly
            // once here.
            unsafe { executor.enqueue(parent) };
        }
    }

    /// Called by the parent task. Returns the next
    /// completion if one is pending, reports exhaustion if none are
    /// outstanding, or parks `waiting_task` to be resumed by a future
    /// `offer`.
    ///
    /// # Safety
    ///
    /// `waiting_task` must point to a live `Job` not already enqueued or
    /// parked anywhere else, and must be the `Job` of the single task
    /// permitted to await this group at a time.
    pub unsafe fn next(&self, waiting_task: NonNull<Job>) -> GroupPoll {
        if let Some(child) = self.pop_pending() {
            return GroupPoll::Ready(child);
        }
        if self.no_outstanding_children() {
            return GroupPoll::Exhausted;
        }

        self.parent_waiter.store(waiting_task.as_ptr() as usize, Ordering::Release);

        // Re-check after registering to close the race against a
        // concurrent `offer` that ran its pending-stack push before we
        // stored into `parent_waiter`. If we win the re-check, clear
        // `parent_waiter` ourselves: a racing `offer` may already have
        // taken and enqueued it, in which case this is a no-op, but if it
        // hasn't, we must not leave a stale self-reference parked.
        if let Some(child) = self.pop_pending() {
            let _ = self.take_parent_waiter();
            return GroupPoll::Ready(child);
        }

        GroupPoll::Pending
    }

    /// Structural cancellation: cancels every outstanding member of this
    /// group. Called when the
    /// owning task observes its own cancellation at a suspension point.
    pub fn cancel(&self) {
        tracing::trace!("cancelling task group");
        // Safety: single-writer discipline on `children_head` means this
        // traversal is safe as long as the owning task is the only caller,
        // matching `register_child`'s contract.
        let mut cursor = unsafe { *self.children_head.get() };
        while let Some(task) = NonNull::new(cursor) {
            // Safety: every node reachable from `children_head` is a live
            // `AsyncTask` registered via `register_child`.
            unsafe {
                task.as_ref().status().cancel();
                cursor = *task.as_ref().group_child_fragment().as_ref().next_sibling.get();
            }
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AsyncContext;
    use crate::job::JobFlags;

    unsafe fn noop_resume(_task: NonNull<Job>, _exec: ExecutorRef, _ctx: NonNull<AsyncContext>) {}
    unsafe fn noop_resume_parent(_task: NonNull<AsyncTask>, _exec: ExecutorRef, _parent: NonNull<AsyncContext>) {}

    fn counting_executor(count: &core::cell::Cell<usize>) -> ExecutorRef {
        static VTABLE: crate::job::ExecutorVTable = crate::job::ExecutorVTable {
            enqueue: |data, _job| {
                // Safety: test-only; `data` points at a live `Cell` for the
                // duration of the call.
                let data = unsafe { data.cast::<core::cell::Cell<usize>>().as_ref() };
                data.set(data.get() + 1);
            },
        };
        let data = NonNull::from(count).cast::<()>();
        // Safety: `count` outlives the `ExecutorRef` in these tests.
        unsafe { ExecutorRef::from_raw(data, &VTABLE) }
    }

    fn plain_context() -> NonNull<AsyncContext> {
        let ctx = alloc::boxed::Box::new(AsyncContext::new_ordinary(noop_resume_parent, counting_executor(&core::cell::Cell::new(0))));
        NonNull::from(alloc::boxed::Box::leak(ctx))
    }

    fn new_group_child(group: NonNull<TaskGroup>) -> NonNull<AsyncTask> {
        let flags = JobFlags::new().with(JobFlags::IS_GROUP_CHILD, true);
        // Safety: `IS_GROUP_CHILD` requires a group, supplied below.
        let task = unsafe { AsyncTask::new(flags, noop_resume, plain_context(), None, Some(group), None) };
        // Safety: freshly allocated, not yet registered with any group.
        unsafe { group.as_ref().register_child(task) };
        task
    }

    #[test]
    fn new_group_is_exhausted() {
        let group = TaskGroup::new();
        assert!(group.no_outstanding_children());
    }

    #[test]
    fn next_is_exhausted_with_no_children() {
        let group = TaskGroup::new();
        let waiter = NonNull::<Job>::dangling();
        // Safety: no outstanding children means `next` returns `Exhausted`
        // before ever touching `waiter`.
        assert!(matches!(unsafe { group.next(waiter) }, GroupPoll::Exhausted));
    }

    #[test]
    fn offer_then_next_is_ready() {
        let group = TaskGroup::new();
        let group_ptr = NonNull::from(&group);
        let child = new_group_child(group_ptr);

        let count = core::cell::Cell::new(0);
        let executor = counting_executor(&count);
        // Safety: `child` is a live group-child task whose future just
        // completed, not yet on any pending stack.
        unsafe { group.offer(child, executor) };

        let waiter = child.cast::<Job>();
        match unsafe { group.next(waiter) } {
            GroupPoll::Ready(ready) => assert_eq!(ready, child),
            _ => panic!("expected Ready"),
        }
        // No parent was parked, so `offer` never enqueued anything.
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn next_parks_then_offer_wakes_it() {
        let group = TaskGroup::new();
        let group_ptr = NonNull::from(&group);
        let child = new_group_child(group_ptr);

        let count = core::cell::Cell::new(0);
        let executor = counting_executor(&count);
        let parent_job = child.cast::<Job>();

        // Safety: a child is outstanding (registered above), so `next`
        // parks rather than reporting `Exhausted`.
        assert!(matches!(unsafe { group.next(parent_job) }, GroupPoll::Pending));

        // Safety: same child as above, completing and being offered.
        unsafe { group.offer(child, executor) };
        // Parking the parent's job enqueues it once its completion is offered.
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn cancel_propagates_to_every_registered_child() {
        let group = TaskGroup::new();
        let group_ptr = NonNull::from(&group);
        let a = new_group_child(group_ptr);
        let b = new_group_child(group_ptr);

        // Safety: neither child has been cancelled yet.
        unsafe {
            assert!(!a.as_ref().is_cancelled());
            assert!(!b.as_ref().is_cancelled());
        }

        group.cancel();

        // Safety: `cancel` walks every registered child.
        unsafe {
            assert!(a.as_ref().is_cancelled());
            assert!(b.as_ref().is_cancelled());
        }
    }
}
