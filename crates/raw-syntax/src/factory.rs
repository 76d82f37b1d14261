// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The [`RawSyntax`] factory: constructs token and layout nodes, copying
//! foreign text into the arena and computing the aggregate length
//! invariants, plus the `with_*`/`append_child`/`replace_child_at`
//! transforms, which always produce a *new* node and never mutate in
//! place.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::arena::SyntaxArena;
use crate::kind::SyntaxKind;
use crate::node::{sum_sub_node_counts, sum_text_lengths, Presence, RawSyntax};
use crate::node_id::NodeId;

/// Constructs a token node.
///
/// `text`/`leading_trivia`/`trailing_trivia` are copied into `arena` unless
/// they already fall within its hot-use region.
#[must_use]
pub fn record_token(
    arena: &Rc<SyntaxArena>,
    kind: SyntaxKind,
    leading_trivia: &str,
    text: &str,
    trailing_trivia: &str,
    node_id: Option<NodeId>,
) -> NonNull<RawSyntax> {
    let leading = arena.intern(leading_trivia);
    let body = arena.intern(text);
    let trailing = arena.intern(trailing_trivia);
    let id = crate::node_id::assign(node_id);
    tracing::trace!(?kind, node_id = ?id, "record_token");
    arena.alloc_node(RawSyntax::new_token(
        id,
        NonNull::from(&**arena),
        kind,
        body,
        leading,
        trailing,
        Presence::Present,
    ))
}

/// Constructs a `Missing` token node: `text_length = 0`, empty trivia.
#[must_use]
pub fn record_missing_token(
    arena: &Rc<SyntaxArena>,
    kind: SyntaxKind,
    node_id: Option<NodeId>,
) -> NonNull<RawSyntax> {
    let id = crate::node_id::assign(node_id);
    tracing::trace!(?kind, node_id = ?id, "record_missing_token");
    arena.alloc_node(RawSyntax::new_token(
        id,
        NonNull::from(&**arena),
        kind,
        "",
        "",
        "",
        Presence::Missing,
    ))
}

/// Constructs a layout node from `children`.
///
/// For every non-null child whose arena differs from `arena`, the child's
/// arena is retained via [`SyntaxArena::add_child_arena`] so it outlives
/// references into it.
///
/// # Safety
///
/// Every non-null pointer in `children` must be a live [`RawSyntax`] whose
/// owning arena is either `arena` itself or reachable by retaining it as a
/// child arena here.
#[must_use]
pub unsafe fn record_raw_syntax(
    arena: &Rc<SyntaxArena>,
    kind: SyntaxKind,
    children: &[Option<NonNull<RawSyntax>>],
    presence: Presence,
    node_id: Option<NodeId>,
) -> NonNull<RawSyntax> {
    let self_ptr = NonNull::from(&**arena);
    for child in children.iter().flatten() {
        // Safety: forwarded from the caller.
        let child_arena = unsafe { child.as_ref().arena() };
        if child_arena != self_ptr {
            // Safety: `child_arena` is a live arena back-reference per the
            // caller's contract; `SyntaxArena::handle` recovers the `Rc`
            // that keeps it alive.
            let child_arena_rc = unsafe { child_arena.as_ref() }.handle();
            arena.add_child_arena(child_arena_rc);
        }
    }

    // Safety: forwarded from the caller.
    let text_length = unsafe { sum_text_lengths(children) };
    // Safety: forwarded from the caller.
    let total_sub_node_count = unsafe { sum_sub_node_counts(children) };

    let stored_children = arena.alloc_children(children);
    let id = crate::node_id::assign(node_id);
    tracing::trace!(?kind, node_id = ?id, children = children.len(), "record_raw_syntax");
    arena.alloc_node(RawSyntax::new_layout(
        id,
        self_ptr,
        kind,
        stored_children,
        presence,
        text_length,
        total_sub_node_count,
    ))
}

/// Constructs a `Missing` layout node: no children, `text_length = 0`.
#[must_use]
pub fn record_missing_raw_syntax(
    arena: &Rc<SyntaxArena>,
    kind: SyntaxKind,
    node_id: Option<NodeId>,
) -> NonNull<RawSyntax> {
    let id = crate::node_id::assign(node_id);
    let stored_children = arena.alloc_children(&[]);
    tracing::trace!(?kind, node_id = ?id, "record_missing_raw_syntax");
    arena.alloc_node(RawSyntax::new_layout(
        id,
        NonNull::from(&**arena),
        kind,
        stored_children,
        Presence::Missing,
        0,
        0,
    ))
}

/// Produces a new token node identical to `token` but with `leading_trivia`
/// replacing its current leading trivia.
///
/// # Safety
///
/// `token` must be a live `Token` node in `arena` (or an arena `arena`
/// transitively retains).
#[must_use]
pub unsafe fn with_leading_trivia(
    arena: &Rc<SyntaxArena>,
    token: NonNull<RawSyntax>,
    leading_trivia: &str,
) -> NonNull<RawSyntax> {
    // Safety: forwarded from the caller.
    let t = unsafe { token.as_ref() };
    let kind = t.kind();
    // Safety: forwarded from the caller; `t.is_token()` is asserted by
    // `token_text`/`trailing_trivia` panicking otherwise.
    let (text, trailing) = unsafe { (t.token_text(), t.trailing_trivia()) };
    record_token(arena, kind, leading_trivia, text, trailing, None)
}

/// Produces a new token node identical to `token` but with `trailing_trivia`
/// replacing its current trailing trivia.
///
/// # Safety
///
/// Same as [`with_leading_trivia`].
#[must_use]
pub unsafe fn with_trailing_trivia(
    arena: &Rc<SyntaxArena>,
    token: NonNull<RawSyntax>,
    trailing_trivia: &str,
) -> NonNull<RawSyntax> {
    // Safety: forwarded from the caller.
    let t = unsafe { token.as_ref() };
    let kind = t.kind();
    // Safety: forwarded from the caller.
    let (leading, text) = unsafe { (t.leading_trivia(), t.token_text()) };
    record_token(arena, kind, leading, text, trailing_trivia, None)
}

/// Produces a new layout node identical to `layout` with `new_child`
/// appended to its children.
///
/// # Safety
///
/// `layout` must be a live `Layout` node; every one of its existing
/// children, plus `new_child` if present, must be live.
#[must_use]
pub unsafe fn append_child(
    arena: &Rc<SyntaxArena>,
    layout: NonNull<RawSyntax>,
    new_child: Option<NonNull<RawSyntax>>,
) -> NonNull<RawSyntax> {
    // Safety: forwarded from the caller.
    let l = unsafe { layout.as_ref() };
    let kind = l.kind();
    let presence = l.presence();
    // Safety: forwarded from the caller.
    let existing = unsafe { l.children() };
    let mut next: Vec<Option<NonNull<RawSyntax>>> = Vec::with_capacity(existing.len() + 1);
    next.extend_from_slice(existing);
    next.push(new_child);
    // Safety: every element of `next` is live per the caller's contract.
    unsafe { record_raw_syntax(arena, kind, &next, presence, None) }
}

/// Produces a new layout node identical to `layout` but with the child at
/// `cursor` replaced by `new_child`.
///
/// # Panics
///
/// Panics if `cursor` is out of bounds.
///
/// # Safety
///
/// Same as [`append_child`].
#[must_use]
pub unsafe fn replace_child_at(
    arena: &Rc<SyntaxArena>,
    layout: NonNull<RawSyntax>,
    cursor: usize,
    new_child: Option<NonNull<RawSyntax>>,
) -> NonNull<RawSyntax> {
    // Safety: forwarded from the caller.
    let l = unsafe { layout.as_ref() };
    let kind = l.kind();
    let presence = l.presence();
    // Safety: forwarded from the caller.
    let existing = unsafe { l.children() };
    assert!(cursor < existing.len(), "replace_child_at: cursor out of bounds");
    let mut next = existing.to_vec();
    next[cursor] = new_child;
    // Safety: every element of `next` is live per the caller's contract.
    unsafe { record_raw_syntax(arena, kind, &next, presence, None) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(arena: &Rc<SyntaxArena>, kind: u16, leading: &str, text: &str, trailing: &str) -> NonNull<RawSyntax> {
        record_token(arena, SyntaxKind(kind), leading, text, trailing, None)
    }

    #[test]
    fn layout_text_length_sums_children() {
        let arena = SyntaxArena::new();
        let children = [
            Some(tok(&arena, 1, "", "if", " ")),
            Some(tok(&arena, 2, "", "(", "")),
            Some(tok(&arena, 3, "", "x", "")),
            Some(tok(&arena, 4, "", ")", " ")),
        ];
        // Safety: all children are live nodes in `arena`.
        let layout = unsafe { record_raw_syntax(&arena, SyntaxKind(100), &children, Presence::Present, None) };
        // Safety: `layout` and `arena` are both live.
        let node = unsafe { layout.as_ref() };
        assert_eq!(node.text_length(), 2 + 1 + 1 + 1 + 2);
        assert_eq!(node.total_sub_node_count(), 4);
    }

    #[test]
    fn missing_token_roundtrip() {
        let arena = SyntaxArena::new();
        let missing = record_missing_token(&arena, SyntaxKind(5), None);
        // Safety: `missing` and `arena` are both live.
        let node = unsafe { missing.as_ref() };
        assert_eq!(node.text_length(), 0);
        assert_eq!(node.presence(), Presence::Missing);
    }

    #[test]
    fn transforms_produce_new_node_not_mutate() {
        let arena = SyntaxArena::new();
        let original = tok(&arena, 1, "", "x", "");
        // Safety: `original` is live.
        let replaced = unsafe { with_leading_trivia(&arena, original, "  ") };
        assert_ne!(original, replaced);
        // Safety: both nodes are live.
        unsafe {
            assert_eq!(original.as_ref().leading_trivia(), "");
            assert_eq!(replaced.as_ref().leading_trivia(), "  ");
            assert_eq!(replaced.as_ref().token_text(), "x");
        }
    }

    #[test]
    fn cross_arena_child_retains_its_arena() {
        let child_arena = SyntaxArena::new();
        let child = tok(&child_arena, 1, "", "x", "");

        let parent_arena = SyntaxArena::new();
        let children = [Some(child)];
        // Safety: `child` is live in `child_arena`, which we are about to retain.
        let _layout = unsafe {
            record_raw_syntax(&parent_arena, SyntaxKind(2), &children, Presence::Present, None)
        };
        assert_eq!(parent_arena.child_arena_count(), 1);

        drop(child_arena);
        // Safety: `parent_arena` retained `child_arena`, so `child` is still live.
        unsafe { assert_eq!(child.as_ref().token_text(), "x") };
    }
}
