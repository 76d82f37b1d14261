// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Core data structures and protocols for a structured-concurrency
//! asynchronous task system: the [`Job`] ABI, the [`AsyncContext`] chain
//! that models a task's call stack across suspension points, the
//! [`AsyncTask`] heap object with its trailing fragments, the status record
//! chain that carries cancellation, and the future/task-group completion
//! protocols built on top.
//!
//! This crate owns only the object model and its invariants. The executor
//! (thread pools, run-queues, scheduling policy) is an external
//! collaborator, identified opaquely by [`ExecutorRef`] and driven through
//! [`ExecutorVTable`]; this crate never spawns a thread itself.
//!
//! Every module is written against `no_std` + `alloc`; `std` is only pulled
//! in for tests (and transparently replaced by `loom`'s shadow types when
//! built with `--cfg loom`, see [`loom`]).

#![no_std]
#![feature(thread_local)]

extern crate alloc;

mod ambient;
mod context;
mod future;
mod group;
mod job;
pub(crate) mod loom;
mod status;
mod task;
#[path = "alloc.rs"]
mod task_alloc;

pub use ambient::{current, enter};
pub use context::{AsyncContext, ResumeParentFn, YieldToParentFn};
pub use future::{FutureFragment, FutureStatus, ValueWitness};
pub use group::{GroupChildFragment, GroupPoll, TaskGroup};
pub use job::{
    ContextFlags, ContextKind, ExecutorRef, ExecutorVTable, Job, JobFlags, Priority, ResumeTaskFn,
    RunJobFn, NEXT_WAITING_TASK_INDEX,
};
pub use status::{AtomicStatusWord, LockedStatus, StatusRecordHeader, StatusWord};
pub use task::{AsyncTask, ChildFragment, FragmentOffsets, InheritPolicy};
