// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`TreeCreator`]/[`SyntaxRoot`]: the tree creator surface, the boundary
//! the parser (out of scope for this core) drives to build a tree, and the
//! handle it ends up holding. `TreeCreator` owns the single arena a parse
//! run builds into and the incremental cache consulted while doing so;
//! `SyntaxRoot` is what `realize_syntax_root` hands back once parsing is
//! done, and is the root syntax data node that keeps the arena alive.

use alloc::rc::Rc;
use core::ops::Range;
use core::ptr::NonNull;

use crate::arena::SyntaxArena;
use crate::cache::NodeCache;
use crate::kind::SyntaxKind;
use crate::node::{Presence, RawSyntax};
use crate::node_id::NodeId;
use crate::{factory, print};

/// Drives construction of one parse's worth of raw syntax into a single
/// arena.
pub struct TreeCreator {
    arena: Rc<SyntaxArena>,
    cache: NodeCache,
    /// The hot-use copy of the source text this creator's tokens slice
    /// their text out of.
    source: *const str,
}

impl TreeCreator {
    /// Starts a fresh tree creator over `source_file`, copying it once into
    /// the creator's own arena as the hot-use region.
    #[must_use]
    pub fn new(source_file: &str) -> Self {
        let arena = SyntaxArena::new();
        let source = arena.adopt_source_text(source_file);
        Self {
            arena,
            cache: NodeCache::new(),
            source: core::ptr::from_ref(source),
        }
    }

    /// Seeds this creator's incremental cache from a prior parse's tree,
    /// so `lookup_node` can serve reuse requests against it.
    #[must_use]
    pub fn with_cache(mut self, cache: NodeCache) -> Self {
        self.cache = cache;
        self
    }

    fn source(&self) -> &str {
        // Safety: `self.source` points into `self.arena`'s bump storage,
        // which outlives `self` (the arena is dropped only when both this
        // creator and every `SyntaxRoot`/child-arena reference to it are
        // gone).
        unsafe { &*self.source }
    }

    /// Records a new token: `range` indexes into this creator's source text
    /// for the token's own spelled text.
    ///
    /// # Panics
    ///
    /// Panics if `range` is out of bounds of the source text.
    #[must_use]
    pub fn record_token(
        &self,
        kind: SyntaxKind,
        leading_trivia: &str,
        trailing_trivia: &str,
        range: Range<usize>,
    ) -> NonNull<RawSyntax> {
        let text = &self.source()[range];
        factory::record_token(&self.arena, kind, leading_trivia, text, trailing_trivia, None)
    }

    /// Records a missing token. `loc` identifies where in the source the
    /// missing token would have been, for diagnostics built on top of this
    /// core; this core itself only needs `kind`.
    #[must_use]
    pub fn record_missing_token(&self, kind: SyntaxKind, _loc: usize) -> NonNull<RawSyntax> {
        factory::record_missing_token(&self.arena, kind, None)
    }

    /// Records a new layout node over `children`.
    ///
    /// # Safety
    ///
    /// Every non-null pointer in `children` must be a live node either in
    /// this creator's arena or in an arena reachable from a prior
    /// `lookup_node`/`add_reusable_arena` call.
    #[must_use]
    pub unsafe fn record_raw_syntax(
        &self,
        kind: SyntaxKind,
        children: &[Option<NonNull<RawSyntax>>],
    ) -> NonNull<RawSyntax> {
        // Safety: forwarded from the caller.
        unsafe { factory::record_raw_syntax(&self.arena, kind, children, Presence::Present, None) }
    }

    /// Looks up a reusable subtree from a prior parse. On a hit, retains
    /// the reused node's owning arena as a child arena of this creator's
    /// arena before handing the node back, so the reused node stays in a
    /// compatible arena relationship with the tree being built.
    #[must_use]
    pub fn lookup_node(&self, lexer_offset: usize, kind: SyntaxKind) -> Option<(u32, NonNull<RawSyntax>)> {
        let (length, node, owning_arena) = self.cache.lookup_node(lexer_offset, kind)?;
        self.arena.add_child_arena(owning_arena);
        Some((length, node))
    }

    /// Records `node` as reusable for a future parse's `lookup_node` at
    /// `lexer_offset`/`kind`, consuming `length_consumed` bytes of source.
    pub fn record_reusable(
        &mut self,
        lexer_offset: usize,
        kind: SyntaxKind,
        length_consumed: u32,
        node: NonNull<RawSyntax>,
    ) {
        self.cache
            .record(lexer_offset, kind, length_consumed, node, Rc::clone(&self.arena));
    }

    /// Hands back this creator's incremental cache, e.g. to seed the next
    /// parse's [`TreeCreator::with_cache`].
    #[must_use]
    pub fn into_cache(self) -> NodeCache {
        self.cache
    }

    /// Finalizes the parse by pairing `root` (the fully built top-level
    /// node the parser hands back) with the arena that owns it, keeping
    /// that arena alive for as long as the returned [`SyntaxRoot`] lives.
    #[must_use]
    pub fn realize_syntax_root(self, root: NonNull<RawSyntax>) -> SyntaxRoot {
        SyntaxRoot {
            arena: self.arena,
            root,
        }
    }
}

/// The published result of a parse: a root node plus the arena that keeps
/// it (and everything it reaches) alive: arenas are freed when the last
/// holder drops them.
pub struct SyntaxRoot {
    arena: Rc<SyntaxArena>,
    root: NonNull<RawSyntax>,
}

impl SyntaxRoot {
    #[must_use]
    pub fn root(&self) -> NonNull<RawSyntax> {
        self.root
    }

    #[must_use]
    pub fn arena(&self) -> &Rc<SyntaxArena> {
        &self.arena
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        // Safety: `self.arena` keeps `self.root` alive for as long as
        // `self` exists.
        unsafe { self.root.as_ref().node_id() }
    }

    /// Reconstructs the exact source text spanned by this tree.
    #[must_use]
    pub fn print(&self) -> alloc::string::String {
        // Safety: `self.arena` keeps `self.root` alive for as long as
        // `self` exists.
        unsafe { print::print(self.root) }
    }

    /// Structural debug dump of this tree.
    #[must_use]
    pub fn debug_dump(&self, options: crate::print::PrintOptions) -> alloc::string::String {
        // Safety: same as `print`.
        unsafe { print::debug_dump(self.root, options) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_source_through_tree_creator() {
        let creator = TreeCreator::new("if (x) ");
        let if_tok = creator.record_token(SyntaxKind(1), "", " ", 0..2);
        let open = creator.record_token(SyntaxKind(2), "", "", 3..4);
        let ident = creator.record_token(SyntaxKind(3), "", "", 4..5);
        let close = creator.record_token(SyntaxKind(4), "", " ", 5..6);
        let children = [Some(if_tok), Some(open), Some(ident), Some(close)];
        // Safety: all children are live in `creator`'s arena.
        let root_node = unsafe { creator.record_raw_syntax(SyntaxKind(100), &children) };
        let root = creator.realize_syntax_root(root_node);
        assert_eq!(root.print(), "if (x) ");
    }

    #[test]
    fn incremental_reuse_returns_prior_root_unchanged() {
        let creator = TreeCreator::new("x");
        let tok = creator.record_token(SyntaxKind(1), "", "", 0..1);
        let children = [Some(tok)];
        // Safety: `tok` is live.
        let root_node = unsafe { creator.record_raw_syntax(SyntaxKind(100), &children) };
        let node_id = unsafe { root_node.as_ref().node_id() };
        let mut creator = creator;
        creator.record_reusable(0, SyntaxKind(100), 1, root_node);
        let cache = creator.into_cache();

        let reparse = TreeCreator::new("x").with_cache(cache);
        let (length, reused) = reparse.lookup_node(0, SyntaxKind(100)).expect("cache hit");
        assert_eq!(length, 1);
        // Safety: `reused` is kept alive by the retained child arena.
        assert_eq!(unsafe { reused.as_ref().node_id() }, node_id);
    }
}
