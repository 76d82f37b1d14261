// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`SyntaxKind`]: the kind tag carried by every raw syntax node, token or
//! layout alike. The parser's grammar, which numeric values mean what, is
//! out of scope for this core; this crate only needs kinds to be small,
//! copyable, hashable values it can tag nodes with and compare for cache
//! lookups.

/// A parser-defined node or token kind.
///
/// Grammars own the meaning of each value; this core treats `SyntaxKind`
/// as an opaque discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SyntaxKind(pub u16);

impl SyntaxKind {
    /// Reserved for callers that have no more specific kind to report, e.g.
    /// a syntax-verification walk encountering a kind it doesn't recognize.
    pub const UNKNOWN: SyntaxKind = SyntaxKind(u16::MAX);

    #[must_use]
    pub const fn is_unknown(self) -> bool {
        self.0 == Self::UNKNOWN.0
    }
}

impl From<u16> for SyntaxKind {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for SyntaxKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SyntaxKind({})", self.0)
    }
}
