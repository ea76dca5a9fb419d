//! Type-safe wrappers for coordination primitives.
//!
//! These newtypes keep node identifiers, election terms, membership versions and
//! checkpoint sequence numbers from being mixed up even though they all share
//! the same `u64` representation on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of a participant node.
///
/// Stable for the node's lifetime in the cluster. Identifiers are totally
/// ordered; the ordering is used as the final tie-break wherever two nodes
/// must be ranked deterministically (concurrent resource requests, token
/// minting).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Create a node identifier from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        NodeId(value)
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = String;

    /// Accepts either a bare integer (`"7"`) or the display form (`"node-7"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let digits = raw.strip_prefix("node-").unwrap_or(raw);
        digits
            .parse::<u64>()
            .map(NodeId)
            .map_err(|e| format!("invalid node id '{}': {}", s, e))
    }
}

/// Election epoch.
///
/// Terms only move forward on a live node. Every node tracks the highest term
/// it has observed and recognises at most one leader per term.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    /// The term every node starts in before any election.
    pub const ZERO: Self = Term(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Term(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The term following this one.
    #[inline]
    pub const fn next(self) -> Self {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version number of a membership snapshot.
///
/// Each version identifies exactly one snapshot on the node that produced it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    #[inline]
    pub const fn new(value: u64) -> Self {
        MembershipVersion(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn next(self) -> Self {
        MembershipVersion(self.0 + 1)
    }
}

impl fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Sequence number of a checkpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct CheckpointSeq(pub u64);

impl CheckpointSeq {
    #[inline]
    pub const fn new(value: u64) -> Self {
        CheckpointSeq(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn next(self) -> Self {
        CheckpointSeq(self.0 + 1)
    }
}

impl fmt::Display for CheckpointSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
