// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`AsyncContext`]: one activation record in the linked chain that models a
//! task's call stack across suspension points.
//!
//! A task's `resume_context` always points at the *innermost* `AsyncContext`;
//! contexts chain outward to the root via [`AsyncContext::parent`], which the
//! context owns (dropping a context drops everything it was nested in).
//! Suspension commits the current activation record here before control is
//! released to the executor.

use alloc::boxed::Box;
use core::any::Any;
use core::ptr::NonNull;

use crate::job::{ContextFlags, ContextKind, ExecutorRef};
use crate::task::AsyncTask;

/// `resume_parent(task, executor, parent)`, a tail call made by a context
/// that is returning control to its parent.
pub type ResumeParentFn = unsafe fn(NonNull<AsyncTask>, ExecutorRef, NonNull<AsyncContext>);

/// `yield_to_parent(task, executor, parent)`, called by a
/// [`ContextKind::Yielding`] context that wants to suspend-and-resume without
/// returning.
pub type YieldToParentFn = unsafe fn(NonNull<AsyncTask>, ExecutorRef, NonNull<AsyncContext>);

/// The payload that distinguishes the `AsyncContext` variants.
enum Payload {
    Ordinary,
    Yielding {
        yield_to_parent: YieldToParentFn,
        yield_to_parent_executor: ExecutorRef,
    },
    Future {
        /// Points at caller-owned storage for the indirect result. Type-erased:
        /// this core never interprets what's written there.
        result: NonNull<()>,
        error: Option<NonNull<dyn Any>>,
    },
    /// A [`Payload::Future`] that additionally owns the closure it was created
    /// to run. Boxed so that dropping the context drops the closure.
    FutureClosure {
        result: NonNull<()>,
        error: Option<NonNull<dyn Any>>,
        closure: NonNull<dyn Any>,
    },
}

/// One activation record in a task's suspension chain.
///
/// Non-copyable: a context represents a unique point of control and is always
/// accessed through a pointer once installed as a task's `resume_context`.
pub struct AsyncContext {
    /// The next-older activation record. Owned: dropping this context drops
    /// its entire parent chain up to the root, whose `parent` is `None`.
    parent: Option<Box<AsyncContext>>,
    /// The continuation to invoke in the parent's frame on return.
    resume_parent: ResumeParentFn,
    resume_parent_executor: ExecutorRef,
    flags: ContextFlags,
    payload: Payload,
}

impl AsyncContext {
    /// Constructs the root, `Ordinary` context of a task's chain.
    #[must_use]
    pub fn new_ordinary(resume_parent: ResumeParentFn, resume_parent_executor: ExecutorRef) -> Self {
        Self {
            parent: None,
            resume_parent,
            resume_parent_executor,
            flags: ContextFlags::new().with(ContextFlags::KIND, ContextKind::Ordinary),
            payload: Payload::Ordinary,
        }
    }

    /// Constructs a `Yielding` context nested under `parent`.
    #[must_use]
    pub fn new_yielding(
        parent: Box<AsyncContext>,
        resume_parent: ResumeParentFn,
        resume_parent_executor: ExecutorRef,
        yield_to_parent: YieldToParentFn,
        yield_to_parent_executor: ExecutorRef,
    ) -> Self {
        Self {
            parent: Some(parent),
            resume_parent,
            resume_parent_executor,
            flags: ContextFlags::new().with(ContextFlags::KIND, ContextKind::Yielding),
            payload: Payload::Yielding {
                yield_to_parent,
                yield_to_parent_executor,
            },
        }
    }

    /// Constructs a `Future` context nested under `parent`. `result` must
    /// point at storage that outlives this context and is sized/aligned for
    /// whatever the future's `result_type` witness describes.
    #[must_use]
    pub fn new_future(
        parent: Box<AsyncContext>,
        resume_parent: ResumeParentFn,
        resume_parent_executor: ExecutorRef,
        result: NonNull<()>,
    ) -> Self {
        Self {
            parent: Some(parent),
            resume_parent,
            resume_parent_executor,
            flags: ContextFlags::new().with(ContextFlags::KIND, ContextKind::Future),
            payload: Payload::Future { result, error: None },
        }
    }

    /// Constructs a `FutureClosure` context: a [`Self::new_future`] context
    /// that additionally owns the type-erased closure it exists to drive.
    #[must_use]
    pub fn new_future_closure(
        parent: Box<AsyncContext>,
        resume_parent: ResumeParentFn,
        resume_parent_executor: ExecutorRef,
        result: NonNull<()>,
        closure: NonNull<dyn Any>,
    ) -> Self {
        Self {
            parent: Some(parent),
            resume_parent,
            resume_parent_executor,
            flags: ContextFlags::new().with(ContextFlags::KIND, ContextKind::FutureClosure),
            payload: Payload::FutureClosure {
                result,
                error: None,
                closure,
            },
        }
    }

    #[must_use]
    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    #[must_use]
    pub fn kind(&self) -> ContextKind {
        self.flags.get(ContextFlags::KIND)
    }

    /// The next-older activation record, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<&AsyncContext> {
        self.parent.as_deref()
    }

    /// Detaches and returns the parent chain, consuming `self`.
    #[must_use]
    pub fn into_parent(self) -> Option<Box<AsyncContext>> {
        self.parent
    }

    #[must_use]
    pub fn resume_parent_fn(&self) -> ResumeParentFn {
        self.resume_parent
    }

    #[must_use]
    pub fn resume_parent_executor(&self) -> ExecutorRef {
        self.resume_parent_executor
    }

    /// Performs the `return` protocol: tail-calls [`Self::resume_parent_fn`]
    /// with the task, the executor this context was told to hop to, and the
    /// parent activation record.
    ///
    /// This always performs the encoded hop; it does not compare
    /// `resume_parent_executor` against the executor the task happens to
    /// currently be running on to elide it.
    ///
    /// # Safety
    ///
    /// `task` must be the `AsyncTask` that owns this context chain, and
    /// `self` must currently be installed as its `resume_context`.
    pub unsafe fn resume_parent(self: Box<Self>, task: NonNull<AsyncTask>) {
        let executor = self.resume_parent_executor;
        let resume_parent = self.resume_parent;
        let Some(parent) = self.parent else {
            panic!("resume_parent called on the root AsyncContext, which has no parent");
        };
        let parent = NonNull::from(Box::leak(parent));
        // Safety: forwarded from the caller's contract.
        unsafe { resume_parent(task, executor, parent) };
    }

    /// `yield_to_parent`, for [`ContextKind::Yielding`] contexts only.
    ///
    /// # Panics
    ///
    /// Panics if this context is not `Yielding`: calling it on any other
    /// kind is a programmer error.
    #[must_use]
    pub fn yield_to_parent_fn(&self) -> YieldToParentFn {
        match &self.payload {
            Payload::Yielding { yield_to_parent, .. } => *yield_to_parent,
            _ => panic!("yield_to_parent_fn called on a non-Yielding AsyncContext"),
        }
    }

    #[must_use]
    pub fn yield_to_parent_executor(&self) -> ExecutorRef {
        match &self.payload {
            Payload::Yielding {
                yield_to_parent_executor,
                ..
            } => *yield_to_parent_executor,
            _ => panic!("yield_to_parent_executor called on a non-Yielding AsyncContext"),
        }
    }

    /// The indirect result slot, for `Future`/`FutureClosure` contexts only.
    ///
    /// # Panics
    ///
    /// Panics if this context has no result slot.
    #[must_use]
    pub fn result_slot(&self) -> NonNull<()> {
        match &self.payload {
            Payload::Future { result, .. } | Payload::FutureClosure { result, .. } => *result,
            Payload::Ordinary | Payload::Yielding { .. } => {
                panic!("result_slot called on an AsyncContext with no result slot")
            }
        }
    }

    #[must_use]
    pub fn error_slot(&self) -> Option<&dyn Any> {
        match &self.payload {
            // Safety: `error` is only ever populated with a pointer into a
            // live error object that outlives this context (caller contract).
            Payload::Future { error, .. } | Payload::FutureClosure { error, .. } => {
                error.map(|e| unsafe { e.as_ref() })
            }
            Payload::Ordinary | Payload::Yielding { .. } => None,
        }
    }

    pub fn set_error_slot(&mut self, error: Option<NonNull<dyn Any>>) {
        match &mut self.payload {
            Payload::Future { error: slot, .. } | Payload::FutureClosure { error: slot, .. } => {
                *slot = error;
            }
            Payload::Ordinary | Payload::Yielding { .. } => {
                panic!("set_error_slot called on an AsyncContext with no error slot")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn noop_resume(_task: NonNull<AsyncTask>, _exec: ExecutorRef, _parent: NonNull<AsyncContext>) {}

    fn dummy_executor() -> ExecutorRef {
        static VTABLE: crate::job::ExecutorVTable = crate::job::ExecutorVTable {
            enqueue: |_, _| {},
        };
        // Safety: the vtable's `enqueue` never dereferences `data`.
        unsafe { ExecutorRef::from_raw(NonNull::dangling(), &VTABLE) }
    }

    #[test]
    fn chain_links_to_root() {
        let root = AsyncContext::new_ordinary(noop_resume, dummy_executor());
        assert!(root.parent().is_none());
        assert_eq!(root.kind(), ContextKind::Ordinary);

        let child = AsyncContext::new_ordinary(noop_resume, dummy_executor());
        let child = AsyncContext {
            parent: Some(Box::new(root)),
            ..child
        };
        assert!(child.parent().is_some());
    }

    #[test]
    #[should_panic(expected = "non-Yielding")]
    fn yield_fn_panics_on_ordinary() {
        let ctx = AsyncContext::new_ordinary(noop_resume, dummy_executor());
        let _ = ctx.yield_to_parent_fn();
    }
}
