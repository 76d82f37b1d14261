// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Syntax verification: an optional post-construction walk that reports
//! unknown-kind nodes through a diagnostic engine. Explicitly non-fatal,
//! this module never panics on a verification failure, only on the same
//! programmer-error invariant violations the rest of this crate panics on
//! (out-of-bounds `replace_child_at`, wrong-variant accessors, ...).

use alloc::string::String;
use core::ptr::NonNull;

use crate::kind::SyntaxKind;
use crate::node::RawSyntax;
use crate::node_id::NodeId;

/// One verification finding.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub node_id: NodeId,
    pub kind: SyntaxKind,
    pub message: String,
}

/// Where [`verify`] reports its findings. The grammar/diagnostic engine
/// that actually renders these to the user is out of scope for this core;
/// this trait is the minimal boundary this core needs.
pub trait DiagnosticSink {
    fn report(&mut self, diagnostic: Diagnostic);
}

/// A [`DiagnosticSink`] that just collects findings, useful for tests and
/// simple callers.
#[derive(Debug, Default)]
pub struct DiagnosticVec(alloc::vec::Vec<Diagnostic>);

impl DiagnosticSink for DiagnosticVec {
    fn report(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }
}

impl DiagnosticVec {
    #[must_use]
    pub fn new() -> Self {
        Self(alloc::vec::Vec::new())
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Diagnostic] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Walks `node` and every node it reaches, reporting each node whose kind
/// `is_known` rejects to `sink`. Never panics on what it finds; this is
/// advisory, not an invariant check.
///
/// # Safety
///
/// `node` and every node reachable from it through `children()` must be
/// live.
pub unsafe fn verify(node: NonNull<RawSyntax>, is_known: &impl Fn(SyntaxKind) -> bool, sink: &mut impl DiagnosticSink) {
    // Safety: forwarded from the caller.
    let n = unsafe { node.as_ref() };
    if !is_known(n.kind()) {
        tracing::trace!(node_id = ?n.node_id(), kind = ?n.kind(), "syntax verification: unknown kind");
        sink.report(Diagnostic {
            node_id: n.node_id(),
            kind: n.kind(),
            message: alloc::format!("unknown syntax kind {:?}", n.kind()),
        });
    }
    if n.is_token() {
        return;
    }
    // Safety: forwarded from the caller.
    for child in unsafe { n.children() }.iter().flatten() {
        // Safety: forwarded from the caller.
        unsafe { verify(*child, is_known, sink) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory;

    #[test]
    fn reports_unknown_kind_nodes() {
        let arena = crate::arena::SyntaxArena::new();
        let token = factory::record_token(&arena, SyntaxKind(99), "", "x", "", None);
        let mut sink = DiagnosticVec::new();
        // Safety: `token` is live.
        unsafe { verify(token, &|k: SyntaxKind| k.0 < 10, &mut sink) };
        assert_eq!(sink.as_slice().len(), 1);
        assert_eq!(sink.as_slice()[0].kind, SyntaxKind(99));
    }

    #[test]
    fn known_kind_produces_no_diagnostic() {
        let arena = crate::arena::SyntaxArena::new();
        let token = factory::record_token(&arena, SyntaxKind(1), "", "x", "", None);
        let mut sink = DiagnosticVec::new();
        // Safety: `token` is live.
        unsafe { verify(token, &|k: SyntaxKind| k.0 < 10, &mut sink) };
        assert!(sink.is_empty());
    }
}
