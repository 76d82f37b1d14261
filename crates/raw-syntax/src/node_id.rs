// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide monotonic node identity.

use core::sync::atomic::{AtomicU64, Ordering};

/// Identifies a [`crate::node::RawSyntax`] uniquely within this process run.
///
/// Stable across incremental reparses when the caller supplies one back in
/// through the cache-reuse path; otherwise assigned from the next-free counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct NodeId(u64);

impl NodeId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_FREE: AtomicU64 = AtomicU64::new(0);

/// Assigns a `NodeId` for a freshly constructed node.
///
/// If `explicit` is `Some`, it is used verbatim and the next-free counter is
/// advanced past it, so a caller-supplied id is never handed out again;
/// otherwise a fresh id is drawn from the counter.
pub(crate) fn assign(explicit: Option<NodeId>) -> NodeId {
    match explicit {
        Some(id) => {
            // `fetch_max` advances the counter past `id` without ever
            // moving it backwards if a higher id was already handed out
            // concurrently.
            NEXT_FREE.fetch_max(id.0 + 1, Ordering::AcqRel);
            id
        }
        None => NodeId(NEXT_FREE.fetch_add(1, Ordering::AcqRel)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_id_advances_counter_past_itself() {
        let explicit = NodeId(10_000);
        assign(Some(explicit));
        let next = assign(None);
        assert!(next.0 > explicit.0);
    }

    #[test]
    fn fresh_ids_are_unique() {
        let a = assign(None);
        let b = assign(None);
        assert_ne!(a, b);
    }
}
