// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Ambient executor context: modelled as a per-thread value established
//! before calling `run_in_fully_established_context`, rather than global
//! mutable state. An executor calls [`enter`] around the call to
//! [`Job::run_in_fully_established_context`](crate::job::Job::run_in_fully_established_context)
//! on each worker thread; code running underneath can then recover the
//! identity of the executor it is currently running on via [`current`]
//! without threading an [`ExecutorRef`] through every call.

use core::cell::Cell;

use cpu_local::cpu_local;

use crate::job::ExecutorRef;

cpu_local! {
    static CURRENT_EXECUTOR: Cell<Option<ExecutorRef>> = const { Cell::new(None) };
}

/// Runs `f` with the ambient "current executor" set to `executor` for the
/// duration of the call, restoring whatever was set before, including if
/// `f` unwinds.
pub fn enter<R>(executor: ExecutorRef, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_EXECUTOR.replace(Some(executor));
    let _restore = RestoreOnDrop(previous);
    f()
}

struct RestoreOnDrop(Option<ExecutorRef>);

impl Drop for RestoreOnDrop {
    fn drop(&mut self) {
        CURRENT_EXECUTOR.set(self.0.take());
    }
}

/// The executor established by the innermost enclosing [`enter`] call on
/// this thread, or `None` if no job is currently running on it.
#[must_use]
pub fn current() -> Option<ExecutorRef> {
    CURRENT_EXECUTOR.get()
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use super::*;
    use crate::job::ExecutorVTable;

    static VTABLE: ExecutorVTable = ExecutorVTable {
        enqueue: |_, _| {},
    };

    fn executor(tag: usize) -> ExecutorRef {
        // Safety: `VTABLE.enqueue` never dereferences `data`; `tag` is used
        // only as an opaque identity, never read through.
        unsafe { ExecutorRef::from_raw(NonNull::new(tag as *mut ()).unwrap(), &VTABLE) }
    }

    #[test]
    fn current_is_none_outside_enter() {
        assert!(current().is_none());
    }

    #[test]
    fn enter_establishes_and_restores_current() {
        assert!(current().is_none());
        enter(executor(1), || {
            assert_eq!(current(), Some(executor(1)));
        });
        assert!(current().is_none());
    }

    #[test]
    fn nested_enter_restores_outer_executor() {
        enter(executor(1), || {
            enter(executor(2), || {
                assert_eq!(current(), Some(executor(2)));
            });
            assert_eq!(current(), Some(executor(1)));
        });
    }
}
