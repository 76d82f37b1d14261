// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The incremental node-reuse cache: given `(lexer_offset, kind)`, returns a
//! previously parsed subtree and its consumed length, so a reparse can skip
//! re-lexing/re-parsing spans the edit didn't touch.
//!
//! The cache is treated as externally supplied: [`NodeCache`] is the
//! concrete, `hashbrown`-backed implementation a tree creator plugs into the
//! parser loop, but nothing here requires callers to use it. Any type
//! implementing the same `(offset, kind) -> (length, node)` contract is just
//! as valid.

use alloc::rc::Rc;
use core::ptr::NonNull;

use hashbrown::HashMap;

use crate::arena::SyntaxArena;
use crate::kind::SyntaxKind;
use crate::node::RawSyntax;

/// One previously parsed subtree, keyed by the lexer offset it started at
/// and its kind.
#[derive(Clone, Copy)]
struct Entry {
    length_consumed: u32,
    node: NonNull<RawSyntax>,
    /// Retained so a reused node's arena is kept alive at least as long as
    /// the cache itself, separate from whatever the eventual consumer
    /// retains it as when it adds it as a child arena of the tree it's
    /// building.
    arena: Rc<SyntaxArena>,
}

/// A `(lexer_offset, kind)`-keyed cache of reusable subtrees from a prior
/// parse.
#[derive(Default)]
pub struct NodeCache {
    entries: HashMap<(usize, SyntaxKind), Entry>,
}

impl NodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Records `node` (owned by `arena`, and consuming `length_consumed`
    /// bytes of source) as reusable from `lexer_offset` for kind `kind`.
    pub fn record(
        &mut self,
        lexer_offset: usize,
        kind: SyntaxKind,
        length_consumed: u32,
        node: NonNull<RawSyntax>,
        arena: Rc<SyntaxArena>,
    ) {
        self.entries.insert(
            (lexer_offset, kind),
            Entry {
                length_consumed,
                node,
                arena,
            },
        );
    }

    /// On a hit, returns the reused node's consumed length and a pointer to
    /// it, along with its owning arena so the caller can `add_child_arena`
    /// it into whatever arena is building the new tree.
    #[must_use]
    pub fn lookup_node(
        &self,
        lexer_offset: usize,
        kind: SyntaxKind,
    ) -> Option<(u32, NonNull<RawSyntax>, Rc<SyntaxArena>)> {
        let entry = self.entries.get(&(lexer_offset, kind))?;
        tracing::trace!(lexer_offset, ?kind, "incremental cache hit");
        Some((entry.length_consumed, entry.node, Rc::clone(&entry.arena)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory;

    #[test]
    fn hit_returns_recorded_node_and_length() {
        let arena = SyntaxArena::new();
        let node = factory::record_token(&arena, SyntaxKind(7), "", "foo", "", None);
        let mut cache = NodeCache::new();
        cache.record(0, SyntaxKind(7), 3, node, Rc::clone(&arena));

        let (len, reused, _arena) = cache.lookup_node(0, SyntaxKind(7)).expect("cache hit");
        assert_eq!(len, 3);
        assert_eq!(reused, node);
        // Safety: both nodes are live.
        unsafe { assert_eq!(reused.as_ref().node_id(), node.as_ref().node_id()) };
    }

    #[test]
    fn miss_on_unknown_offset() {
        let cache = NodeCache::new();
        assert!(cache.lookup_node(0, SyntaxKind(1)).is_none());
    }
}
