// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`RawSyntax`]: the immutable, shareable backbone of the syntax tree. A
//! node is either a `Token` (kind, text, leading/trailing trivia) or a
//! `Layout` (kind, ordered children), never both, discriminated by
//! [`RawSyntax::is_token`].
//!
//! Rust has no flexible-array-member equivalent (the same observation
//! `task-runtime`'s `AsyncTask` trailing fragments make of its own ABI), so
//! a `Layout` node's children live in their own bump allocation rather than
//! inline after the node; the node stores a pointer-and-length back to that
//! allocation instead.

use core::ptr::NonNull;

use crate::arena::SyntaxArena;
use crate::kind::SyntaxKind;
use crate::node_id::NodeId;

/// Whether a node is actually present in the source it was parsed from, or
/// is a placeholder the parser synthesized to keep the tree shape regular
/// in the face of a syntax error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Missing,
}

/// A `(pointer, length)` slice into some [`SyntaxArena`]'s bump storage.
#[derive(Clone, Copy)]
struct ArenaStr {
    ptr: NonNull<u8>,
    len: u32,
}

impl ArenaStr {
    const EMPTY: ArenaStr = ArenaStr {
        ptr: NonNull::dangling(),
        len: 0,
    };

    fn new(s: &str) -> Self {
        if s.is_empty() {
            return Self::EMPTY;
        }
        Self {
            // Safety: `s` is a `&str`, i.e. non-null by construction.
            ptr: unsafe { util::non_null(s.as_ptr().cast_mut()) },
            len: u32::try_from(s.len()).expect("token/trivia text longer than u32::MAX bytes"),
        }
    }

    /// # Safety
    ///
    /// The arena that originally interned this slice (or the caller's own
    /// equivalent guarantee) must still be alive.
    unsafe fn as_str(&self) -> &str {
        if self.len == 0 {
            return "";
        }
        // Safety: forwarded from the caller; `ptr`/`len` were produced by
        // `SyntaxArena::intern`, which only ever hands back valid UTF-8
        // arena storage.
        unsafe {
            let bytes = core::slice::from_raw_parts(self.ptr.as_ptr(), self.len as usize);
            core::str::from_utf8_unchecked(bytes)
        }
    }
}

struct TokenData {
    kind: SyntaxKind,
    text: ArenaStr,
    leading_trivia: ArenaStr,
    trailing_trivia: ArenaStr,
}

struct LayoutData {
    kind: SyntaxKind,
    children: NonNull<[Option<NonNull<RawSyntax>>]>,
    total_sub_node_count: u32,
}

enum Payload {
    Token(TokenData),
    Layout(LayoutData),
}

/// An immutable raw syntax node. Once constructed, never mutated; the
/// `with_*`/`append_child`/`replace_child_at` transforms in
/// [`crate::factory`] all produce a new node rather than editing this one
/// in place.
pub struct RawSyntax {
    node_id: NodeId,
    /// Non-owning: the arena is kept alive externally, a node never raises
    /// its refcount.
    arena: NonNull<SyntaxArena>,
    text_length: u32,
    presence: Presence,
    payload: Payload,
}

// Arenas are single-writer, read-only-after-publication and carry no
// synchronization of their own; a node's raw back-reference into one must
// never be sent or shared across threads on its own.
static_assertions::assert_not_impl_any!(RawSyntax: Send, Sync);

impl RawSyntax {
    pub(crate) fn new_token(
        node_id: NodeId,
        arena: NonNull<SyntaxArena>,
        kind: SyntaxKind,
        text: &str,
        leading_trivia: &str,
        trailing_trivia: &str,
        presence: Presence,
    ) -> Self {
        let text_length = match presence {
            Presence::Missing => 0,
            Presence::Present => {
                u32::try_from(leading_trivia.len() + text.len() + trailing_trivia.len())
                    .expect("token text_length overflowed u32")
            }
        };
        Self {
            node_id,
            arena,
            text_length,
            presence,
            payload: Payload::Token(TokenData {
                kind,
                text: ArenaStr::new(text),
                leading_trivia: ArenaStr::new(leading_trivia),
                trailing_trivia: ArenaStr::new(trailing_trivia),
            }),
        }
    }

    pub(crate) fn new_layout(
        node_id: NodeId,
        arena: NonNull<SyntaxArena>,
        kind: SyntaxKind,
        children: NonNull<[Option<NonNull<RawSyntax>>]>,
        presence: Presence,
        text_length: u32,
        total_sub_node_count: u32,
    ) -> Self {
        Self {
            node_id,
            arena,
            text_length,
            presence,
            payload: Payload::Layout(LayoutData {
                kind,
                children,
                total_sub_node_count,
            }),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn arena(&self) -> NonNull<SyntaxArena> {
        self.arena
    }

    #[must_use]
    pub fn text_length(&self) -> u32 {
        self.text_length
    }

    #[must_use]
    pub fn presence(&self) -> Presence {
        self.presence
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        self.presence == Presence::Present
    }

    #[must_use]
    pub fn is_token(&self) -> bool {
        matches!(self.payload, Payload::Token(_))
    }

    #[must_use]
    pub fn kind(&self) -> SyntaxKind {
        match &self.payload {
            Payload::Token(t) => t.kind,
            Payload::Layout(l) => l.kind,
        }
    }

    /// # Panics
    ///
    /// Panics if this node is a `Layout` node.
    ///
    /// # Safety
    ///
    /// This node's arena (and every arena transitively retained as its
    /// child arena) must still be alive.
    #[must_use]
    pub unsafe fn token_text(&self) -> &str {
        match &self.payload {
            // Safety: forwarded from the caller.
            Payload::Token(t) => unsafe { t.text.as_str() },
            Payload::Layout(_) => panic!("token_text() called on a Layout node"),
        }
    }

    /// # Panics
    ///
    /// Panics if this node is a `Layout` node.
    ///
    /// # Safety
    ///
    /// Same as [`Self::token_text`].
    #[must_use]
    pub unsafe fn leading_trivia(&self) -> &str {
        match &self.payload {
            Payload::Token(t) => unsafe { t.leading_trivia.as_str() },
            Payload::Layout(_) => panic!("leading_trivia() called on a Layout node"),
        }
    }

    /// # Panics
    ///
    /// Panics if this node is a `Layout` node.
    ///
    /// # Safety
    ///
    /// Same as [`Self::token_text`].
    #[must_use]
    pub unsafe fn trailing_trivia(&self) -> &str {
        match &self.payload {
            Payload::Token(t) => unsafe { t.trailing_trivia.as_str() },
            Payload::Layout(_) => panic!("trailing_trivia() called on a Layout node"),
        }
    }

    /// # Panics
    ///
    /// Panics if this node is a `Token` node.
    ///
    /// # Safety
    ///
    /// Every non-null child pointer must still be live (i.e. this node's
    /// arena and all its transitively retained child arenas are alive).
    #[must_use]
    pub unsafe fn children(&self) -> &[Option<NonNull<RawSyntax>>] {
        match &self.payload {
            // Safety: forwarded from the caller; `children` was allocated
            // by `SyntaxArena::alloc_children` and never mutated after.
            Payload::Layout(l) => unsafe { l.children.as_ref() },
            Payload::Token(_) => panic!("children() called on a Token node"),
        }
    }

    #[must_use]
    pub fn num_children(&self) -> usize {
        match &self.payload {
            // Safety: only the slice's metadata (length) is read, not its
            // contents, so this is sound even if a child has since been
            // freed alongside a dropped arena.
            Payload::Layout(l) => unsafe { l.children.as_ref() }.len(),
            Payload::Token(_) => 0,
        }
    }

    /// # Panics
    ///
    /// Panics if this node is a `Token` node.
    #[must_use]
    pub fn total_sub_node_count(&self) -> u32 {
        match &self.payload {
            Payload::Layout(l) => l.total_sub_node_count,
            Payload::Token(_) => panic!("total_sub_node_count() called on a Token node"),
        }
    }
}

/// Computes `Σ (1 + child.total_sub_node_count)` over non-null children.
///
/// # Safety
///
/// Every non-null child in `children` must be live.
pub(crate) unsafe fn sum_sub_node_counts(children: &[Option<NonNull<RawSyntax>>]) -> u32 {
    children.iter().fold(0u32, |acc, child| match child {
        // Safety: forwarded from the caller.
        Some(c) => acc + 1 + unsafe { c.as_ref().total_sub_node_count_for_layout() },
        None => acc,
    })
}

impl RawSyntax {
    fn total_sub_node_count_for_layout(&self) -> u32 {
        match &self.payload {
            Payload::Layout(l) => l.total_sub_node_count,
            Payload::Token(_) => 0,
        }
    }
}

/// Computes `Σ present children's text_length` over present children.
///
/// # Safety
///
/// Every non-null child in `children` must be live.
pub(crate) unsafe fn sum_text_lengths(children: &[Option<NonNull<RawSyntax>>]) -> u32 {
    children.iter().fold(0u32, |acc, child| match child {
        // Safety: forwarded from the caller.
        Some(c) => acc + unsafe { c.as_ref().text_length() },
        None => acc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::SyntaxArena;

    #[test]
    fn missing_token_has_zero_length() {
        let arena = SyntaxArena::new();
        let node = RawSyntax::new_token(
            crate::node_id::assign(None),
            NonNull::from(&*arena),
            SyntaxKind(1),
            "",
            "",
            "",
            Presence::Missing,
        );
        assert_eq!(node.text_length(), 0);
    }

    #[test]
    fn present_token_length_is_leading_plus_text_plus_trailing() {
        let arena = SyntaxArena::new();
        let node = RawSyntax::new_token(
            crate::node_id::assign(None),
            NonNull::from(&*arena),
            SyntaxKind(2),
            "if",
            " ",
            "",
            Presence::Present,
        );
        assert_eq!(node.text_length(), 3);
        // Safety: `arena` is still alive.
        unsafe {
            assert_eq!(node.token_text(), "if");
            assert_eq!(node.leading_trivia(), " ");
        }
    }
}
