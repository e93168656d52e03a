//! The ambient transport boundary. This module defines the narrow surface this crate
//! needs from it: a stable, hashable peer identifier, and the handful of
//! notions ("direction", "conn addrs") the gater's decision algorithm
//! references. No actual transport (libp2p or otherwise) is implemented or
//! depended upon here.

use std::fmt;
use std::str::FromStr;

/// A stable identifier for a network participant, derived by the transport
/// layer from its long-lived public key. Opaque to this crate beyond parsing,
/// hashing, and equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(String);

impl PeerId {
    /// Parses a peer id from its canonical string form.
    ///
    /// The ambient transport's peer ids are opaque to this crate; the only
    /// invariant we enforce is that
    /// the string is non-empty and contains no whitespace or control
    /// characters, since allowlist lines are whitespace-delimited (spec
    /// §4.1) and must be representable on one line.
    pub fn parse(s: &str) -> Result<Self, PeerIdParseError> {
        let t = s.trim();
        if t.is_empty() {
            return Err(PeerIdParseError::Empty);
        }
        if t.chars().any(char::is_whitespace) {
            return Err(PeerIdParseError::ContainsWhitespace);
        }
        if t.chars().any(char::is_control) {
            return Err(PeerIdParseError::ContainsControlChar);
        }
        Ok(Self(t.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A short form suitable for logs (first 12 chars), matching the
    /// `peer_short` notion the gater's `on_decision` callback uses (spec
    /// §4.10).
    #[must_use]
    pub fn short(&self) -> &str {
        let n = self.0.char_indices().nth(12).map_or(self.0.len(), |(i, _)| i);
        &self.0[..n]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Reason a raw string failed to parse as a [`PeerId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerIdParseError {
    #[error("peer id is empty")]
    Empty,
    #[error("peer id contains whitespace")]
    ContainsWhitespace,
    #[error("peer id contains a control character")]
    ContainsControlChar,
}

/// Direction of an inbound/outbound connection, as reported by the transport
/// layer's pre-upgrade hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}
