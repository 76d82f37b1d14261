// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Source reconstruction and the debug dump. The dump format is pinned so
//! it's testable: `kind @ text_length` per line, two-space indent per
//! depth, trivia shown inline on token lines.

use alloc::string::String;
use core::fmt::Write as _;
use core::ptr::NonNull;

use crate::node::RawSyntax;

/// Controls for [`print`]/[`debug_dump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrintOptions {
    /// Render a structural dump instead of the verbatim source text.
    pub visual: bool,
    /// Include each node's [`crate::kind::SyntaxKind`] in the dump.
    pub print_syntax_kind: bool,
    /// Include nodes carrying no semantically meaningful trivia/text
    /// (reserved for a richer "trivial node" classification a grammar may
    /// layer on top; this core treats every node as non-trivial, so this
    /// flag currently has no visible effect: it exists so callers can
    /// thread the option through without a breaking change later).
    pub print_trivial_node_kind: bool,
}

/// Reconstructs the exact source slice spanned by `node` (leading trivia +
/// text + trailing trivia for tokens, concatenated children for layouts),
/// verbatim.
///
/// # Safety
///
/// `node` and every node reachable from it through `children()` must be
/// live.
#[must_use]
pub unsafe fn print(node: NonNull<RawSyntax>) -> String {
    let mut out = String::new();
    // Safety: forwarded from the caller.
    unsafe { write_source(node, &mut out) };
    out
}

unsafe fn write_source(node: NonNull<RawSyntax>, out: &mut String) {
    // Safety: forwarded from the caller.
    let n = unsafe { node.as_ref() };
    if !n.is_present() {
        return;
    }
    if n.is_token() {
        // Safety: `n.is_token()` just confirmed this is sound.
        unsafe {
            out.push_str(n.leading_trivia());
            out.push_str(n.token_text());
            out.push_str(n.trailing_trivia());
        }
        return;
    }
    // Safety: `n` is a layout node (the token branch returned above); every
    // child is live per the caller's contract.
    for child in unsafe { n.children() }.iter().flatten() {
        // Safety: forwarded from the caller.
        unsafe { write_source(*child, out) };
    }
}

/// Structural debug dump: one child per indented line, two spaces per
/// depth, formatted as
/// `kind @ text_length` (with trivia shown inline for tokens when
/// `options.visual` requests source-accurate rendering alongside
/// structure).
///
/// # Safety
///
/// Same as [`print`].
#[must_use]
pub unsafe fn debug_dump(node: NonNull<RawSyntax>, options: PrintOptions) -> String {
    let mut out = String::new();
    // Safety: forwarded from the caller.
    unsafe { write_dump(node, 0, options, &mut out) };
    out
}

unsafe fn write_dump(node: NonNull<RawSyntax>, depth: usize, options: PrintOptions, out: &mut String) {
    // Safety: forwarded from the caller.
    let n = unsafe { node.as_ref() };
    for _ in 0..depth {
        out.push_str("  ");
    }

    if options.print_syntax_kind {
        let _ = write!(out, "{} @ {}", n.kind(), n.text_length());
    } else {
        let _ = write!(out, "@ {}", n.text_length());
    }

    if !n.is_present() {
        out.push_str(" <missing>");
    }

    if n.is_token() {
        // Safety: `n.is_token()` confirms this is sound.
        unsafe {
            if options.visual {
                let _ = write!(
                    out,
                    " {:?}{:?}{:?}",
                    n.leading_trivia(),
                    n.token_text(),
                    n.trailing_trivia()
                );
            } else {
                let _ = write!(out, " {:?}", n.token_text());
            }
        }
        out.push('\n');
        return;
    }

    out.push('\n');
    // Safety: forwarded from the caller.
    for child in unsafe { n.children() }.iter().flatten() {
        // Safety: forwarded from the caller.
        unsafe { write_dump(*child, depth + 1, options, out) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory;
    use crate::kind::SyntaxKind;
    use crate::node::Presence;

    #[test]
    fn print_reconstructs_exact_source() {
        let arena = crate::arena::SyntaxArena::new();
        let children = [
            Some(factory::record_token(&arena, SyntaxKind(1), "", "if", " ", None)),
            Some(factory::record_token(&arena, SyntaxKind(2), "", "(", "", None)),
            Some(factory::record_token(&arena, SyntaxKind(3), "", "x", "", None)),
            Some(factory::record_token(&arena, SyntaxKind(4), "", ")", " ", None)),
        ];
        // Safety: all children are live.
        let layout = unsafe {
            factory::record_raw_syntax(&arena, SyntaxKind(100), &children, Presence::Present, None)
        };
        // Safety: `layout` is live.
        let source = unsafe { print(layout) };
        assert_eq!(source, "if (x) ");
    }

    #[test]
    fn debug_dump_indents_one_child_per_line() {
        let arena = crate::arena::SyntaxArena::new();
        let child = factory::record_token(&arena, SyntaxKind(1), "", "x", "", None);
        let children = [Some(child)];
        // Safety: `child` is live.
        let layout = unsafe {
            factory::record_raw_syntax(&arena, SyntaxKind(100), &children, Presence::Present, None)
        };
        // Safety: `layout` is live.
        let dump = unsafe { debug_dump(layout, PrintOptions::default()) };
        let mut lines = dump.lines();
        assert!(lines.next().unwrap().starts_with("@ 1"));
        assert!(lines.next().unwrap().starts_with("  @ 1"));
    }
}
