// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`SyntaxArena`]: a `bumpalo`-backed bump allocator that owns the storage
//! backing every [`RawSyntax`] node allocated from it, plus the set of
//! other arenas it must keep alive because some node it owns references
//! their nodes.
//!
//! Arenas are single-writer during construction and read-only after
//! publication: there is no synchronization here beyond what
//! `Rc`/`RefCell` already give a single-threaded builder.

use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;

use bumpalo::Bump;

use crate::node::RawSyntax;

/// A `[begin, end)` byte range into an externally provided source buffer
/// that this arena has been told to treat as "hot": already-resident text
/// that token construction should slice into directly rather than copy.
#[derive(Clone, Copy)]
struct HotUseRegion {
    begin: *const u8,
    end: *const u8,
}

/// A bump allocator that owns a set of [`RawSyntax`] nodes and retains, by
/// reference, every other arena those nodes reach into. Cross-arena
/// retention is a refcount on arenas, not on nodes.
pub struct SyntaxArena {
    bump: Bump,
    /// Lets a `&SyntaxArena` reached through a node's raw back-reference
    /// recover the `Rc` needed to retain a sibling arena, without the node
    /// itself holding a strong reference: nodes never raise their arena's
    /// refcount.
    self_ref: RefCell<Weak<SyntaxArena>>,
    children: RefCell<Vec<Rc<SyntaxArena>>>,
    hot_use: Cell<Option<HotUseRegion>>,
    node_count: Cell<u64>,
    bytes_allocated: Cell<usize>,
}

// `Cell`/`RefCell` make this a single-threaded, single-writer type; it must
// never be shared across threads.
static_assertions::assert_not_impl_any!(SyntaxArena: Sync);

impl SyntaxArena {
    /// Constructs an empty arena.
    #[must_use]
    pub fn new() -> Rc<Self> {
        let arena = Rc::new(Self {
            bump: Bump::new(),
            self_ref: RefCell::new(Weak::new()),
            children: RefCell::new(Vec::new()),
            hot_use: Cell::new(None),
            node_count: Cell::new(0),
            bytes_allocated: Cell::new(0),
        });
        *arena.self_ref.borrow_mut() = Rc::downgrade(&arena);
        arena
    }

    /// Copies `source` into this arena's own storage once, and remembers the
    /// resulting byte range as the "hot use" region: subsequent token text
    /// slices that fall inside it are treated as already arena-resident and
    /// are not re-copied.
    ///
    /// Returns the arena-owned copy so the caller can re-lex against
    /// storage this arena actually owns.
    #[must_use]
    pub fn adopt_source_text<'s>(&'s self, source: &str) -> &'s str {
        let copy = self.bump.alloc_str(source);
        self.bytes_allocated.set(self.bytes_allocated.get() + copy.len());
        self.hot_use.set(Some(HotUseRegion {
            begin: copy.as_ptr(),
            end: copy.as_ptr().wrapping_add(copy.len()),
        }));
        copy
    }

    /// Whether `text` falls entirely within this arena's hot-use region,
    /// i.e. is already arena-resident and does not need to be copied in.
    #[must_use]
    pub(crate) fn contains_hot(&self, text: &str) -> bool {
        let Some(region) = self.hot_use.get() else {
            return false;
        };
        let start = text.as_ptr();
        // Safety: only used for an address-range comparison; the resulting
        // pointer is never dereferenced if it falls outside the arena's own
        // allocation (a zero-length slice's one-past-end pointer is a valid
        // address to compute without dereferencing it).
        let end = start.wrapping_add(text.len());
        start >= region.begin && end <= region.end
    }

    /// Copies `text` into this arena's bump storage, unless it is already
    /// resident (hot-use region), in which case the original slice is
    /// reused verbatim.
    pub(crate) fn intern(&self, text: &str) -> &str {
        if text.is_empty() {
            return "";
        }
        if self.contains_hot(text) {
            tracing::trace!(len = text.len(), "token text already arena-resident");
            return text;
        }
        let copy = self.bump.alloc_str(text);
        self.bytes_allocated.set(self.bytes_allocated.get() + copy.len());
        copy
    }

    pub(crate) fn alloc_node(&self, node: RawSyntax) -> NonNull<RawSyntax> {
        let reference = self.bump.alloc(node);
        self.node_count.set(self.node_count.get() + 1);
        self.bytes_allocated
            .set(self.bytes_allocated.get() + core::mem::size_of::<RawSyntax>());
        NonNull::from(reference)
    }

    pub(crate) fn alloc_children(
        &self,
        children: &[Option<NonNull<RawSyntax>>],
    ) -> NonNull<[Option<NonNull<RawSyntax>>]> {
        let slice = self.bump.alloc_slice_copy(children);
        self.bytes_allocated
            .set(self.bytes_allocated.get() + core::mem::size_of_val(slice));
        NonNull::from(slice)
    }

    /// Adds `child` as a child arena of `self`, extending `child`'s lifetime
    /// to at least that of `self`. A node may only reference children
    /// stored in the same arena or in an arena that has been added as a
    /// child arena of this arena, transitively.
    pub fn add_child_arena(&self, child: Rc<SyntaxArena>) {
        let is_self = self
            .self_ref
            .borrow()
            .upgrade()
            .is_some_and(|this| Rc::ptr_eq(&this, &child));
        if is_self {
            return;
        }
        let mut children = self.children.borrow_mut();
        if children.iter().any(|existing| Rc::ptr_eq(existing, &child)) {
            return;
        }
        tracing::trace!("retaining child arena");
        children.push(child);
    }

    /// Recovers a strong handle to this arena from a `&SyntaxArena` reached
    /// through a node's non-owning back-reference, so it can be retained as
    /// someone else's child arena.
    ///
    /// # Panics
    ///
    /// Panics if every `Rc<SyntaxArena>` pointing at this arena has already
    /// been dropped. This would mean a live node outlived its own arena,
    /// which violates the rule that raw syntax nodes live as long as their
    /// arena.
    #[must_use]
    pub(crate) fn handle(&self) -> Rc<SyntaxArena> {
        self.self_ref
            .borrow()
            .upgrade()
            .expect("SyntaxArena::handle called after the arena's last Rc was dropped")
    }

    /// Number of [`RawSyntax`] nodes allocated directly from this arena.
    #[must_use]
    pub fn node_count(&self) -> u64 {
        self.node_count.get()
    }

    /// Total bytes handed out by this arena's bump allocator so far.
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.get()
    }

    /// Number of other arenas retained as children of this one.
    #[must_use]
    pub fn child_arena_count(&self) -> usize {
        self.children.borrow().len()
    }
}

impl core::fmt::Debug for SyntaxArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyntaxArena")
            .field("node_count", &self.node_count.get())
            .field("bytes_allocated", &self.bytes_allocated.get())
            .field("child_arenas", &self.children.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hot_use_region_is_not_recopied() {
        let arena = SyntaxArena::new();
        let source = arena.adopt_source_text("if (x) ");
        let slice = &source[0..2];
        assert!(arena.contains_hot(slice));
        let interned = arena.intern(slice);
        assert_eq!(interned.as_ptr(), slice.as_ptr());
    }

    #[test]
    fn foreign_text_is_copied() {
        let arena = SyntaxArena::new();
        let foreign = alloc::string::String::from("foreign");
        let interned = arena.intern(&foreign);
        assert_eq!(interned, "foreign");
        assert_ne!(interned.as_ptr(), foreign.as_ptr());
    }

    #[test]
    fn child_arena_retained_once() {
        let parent = SyntaxArena::new();
        let child = SyntaxArena::new();
        parent.add_child_arena(Rc::clone(&child));
        parent.add_child_arena(Rc::clone(&child));
        assert_eq!(parent.child_arena_count(), 1);
    }

    #[test]
    fn self_arena_not_added_as_its_own_child() {
        let arena = SyntaxArena::new();
        arena.add_child_arena(Rc::clone(&arena));
        assert_eq!(arena.child_arena_count(), 0);
    }
}
