//! Membership store.
//!
//! Tracks cluster composition and per-node liveness status. Every status
//! transition bumps the [`MembershipVersion`] and is appended to a bounded
//! change log, so a version always identifies exactly one snapshot on the node
//! that produced it.
//!
//! # Status lifecycle
//!
//! ```text
//!   join ──► Joining ──activate──► Active ◄──activate── Suspected
//!                                    │                      ▲
//!                                    └─────mark_suspected───┘
//!   any (except Left) ──mark_failed──► Failed
//!   any ──leave──► Left
//!   Suspected | Failed | Left ──join──► Joining   (rejoin)
//! ```
//!
//! Suspected members are excluded from elections and token circulation but
//! stay in the member set until they are explicitly failed or contact resumes.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::MEMBERSHIP_CHANGE_LOG_LIMIT;
use crate::error::{CoordError, Result};
use crate::types::{MembershipVersion, NodeId};

/// Liveness status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    Joining,
    Active,
    Suspected,
    Failed,
    Left,
}

impl MemberStatus {
    pub const ALL: [MemberStatus; 5] = [
        MemberStatus::Joining,
        MemberStatus::Active,
        MemberStatus::Suspected,
        MemberStatus::Failed,
        MemberStatus::Left,
    ];

    /// Rank used to break ties when two replicas recorded different statuses
    /// at the same version. Departure wins over liveness.
    fn precedence(self) -> u8 {
        match self {
            MemberStatus::Joining => 0,
            MemberStatus::Active => 1,
            MemberStatus::Suspected => 2,
            MemberStatus::Failed => 3,
            MemberStatus::Left => 4,
        }
    }

    /// Members in these states count toward the quorum base.
    pub fn counts_toward_quorum(self) -> bool {
        !matches!(self, MemberStatus::Failed | MemberStatus::Left)
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberStatus::Joining => "joining",
            MemberStatus::Active => "active",
            MemberStatus::Suspected => "suspected",
            MemberStatus::Failed => "failed",
            MemberStatus::Left => "left",
        };
        f.write_str(s)
    }
}

/// Status of one member plus the version at which it was last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub status: MemberStatus,
    pub updated_at: MembershipVersion,
}

impl MemberRecord {
    /// Last-writer-wins comparison used by [`MembershipStore::merge`].
    fn supersedes(&self, other: &MemberRecord) -> bool {
        (self.updated_at, self.status.precedence()) > (other.updated_at, other.status.precedence())
    }
}

/// Immutable view of the membership at one version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    pub version: MembershipVersion,
    pub members: BTreeMap<NodeId, MemberRecord>,
}

impl MembershipSnapshot {
    pub fn status_of(&self, node: NodeId) -> Option<MemberStatus> {
        self.members.get(&node).map(|r| r.status)
    }

    pub fn active_members(&self) -> Vec<NodeId> {
        self.with_status(MemberStatus::Active)
    }

    pub fn with_status(&self, status: MemberStatus) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn count(&self, status: MemberStatus) -> usize {
        self.members.values().filter(|r| r.status == status).count()
    }
}

/// One entry of the membership change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub version: MembershipVersion,
    pub node: NodeId,
    pub from: Option<MemberStatus>,
    pub to: MemberStatus,
}

/// Per-node membership state.
#[derive(Debug, Clone)]
pub struct MembershipStore {
    version: MembershipVersion,
    members: BTreeMap<NodeId, MemberRecord>,
    changes: VecDeque<MembershipChange>,
}

impl MembershipStore {
    /// Create a store with every seed member Active at version 1.
    ///
    /// An empty seed list yields an empty store at version 0.
    pub fn with_seeds<I>(seeds: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut members = BTreeMap::new();
        for node in seeds {
            members.insert(
                node,
                MemberRecord {
                    status: MemberStatus::Active,
                    updated_at: MembershipVersion(1),
                },
            );
        }
        let version = if members.is_empty() {
            MembershipVersion(0)
        } else {
            MembershipVersion(1)
        };
        Self {
            version,
            members,
            changes: VecDeque::new(),
        }
    }

    /// Rebuild a store from a snapshot (checkpoint restore).
    pub fn from_snapshot(snapshot: MembershipSnapshot) -> Self {
        Self {
            version: snapshot.version,
            members: snapshot.members,
            changes: VecDeque::new(),
        }
    }

    pub fn version(&self) -> MembershipVersion {
        self.version
    }

    pub fn status_of(&self, node: NodeId) -> Option<MemberStatus> {
        self.members.get(&node).map(|r| r.status)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains_key(&node)
    }

    pub fn is_active(&self, node: NodeId) -> bool {
        self.status_of(node) == Some(MemberStatus::Active)
    }

    /// Add a node in Joining status, or rejoin a departed one.
    ///
    /// Joining an already Joining or Active node is a no-op and returns the
    /// current version.
    pub fn join(&mut self, node: NodeId) -> MembershipVersion {
        match self.status_of(node) {
            Some(MemberStatus::Joining) | Some(MemberStatus::Active) => self.version,
            _ => self.apply(node, MemberStatus::Joining),
        }
    }

    /// Promote a Joining or Suspected member to Active.
    pub fn activate(&mut self, node: NodeId) -> Result<MembershipVersion> {
        self.transition(node, MemberStatus::Active, |from| {
            matches!(from, MemberStatus::Joining | MemberStatus::Suspected)
        })
    }

    pub fn mark_suspected(&mut self, node: NodeId) -> Result<MembershipVersion> {
        self.transition(node, MemberStatus::Suspected, |from| {
            matches!(from, MemberStatus::Joining | MemberStatus::Active)
        })
    }

    pub fn mark_failed(&mut self, node: NodeId) -> Result<MembershipVersion> {
        self.transition(node, MemberStatus::Failed, |from| from != MemberStatus::Left)
    }

    pub fn leave(&mut self, node: NodeId) -> Result<MembershipVersion> {
        self.transition(node, MemberStatus::Left, |_| true)
    }

    fn transition(
        &mut self,
        node: NodeId,
        to: MemberStatus,
        allowed: impl Fn(MemberStatus) -> bool,
    ) -> Result<MembershipVersion> {
        let from = self.status_of(node).ok_or(CoordError::UnknownMember(node))?;
        if from == to {
            return Ok(self.version);
        }
        if !allowed(from) {
            return Err(CoordError::InvalidTransition { node, from, to });
        }
        Ok(self.apply(node, to))
    }

    fn apply(&mut self, node: NodeId, to: MemberStatus) -> MembershipVersion {
        let from = self.status_of(node);
        self.version = self.version.next();
        self.members.insert(
            node,
            MemberRecord {
                status: to,
                updated_at: self.version,
            },
        );
        self.record_change(node, from, to);
        info!(
            node = %node,
            from = ?from,
            to = %to,
            version = %self.version,
            "Membership transition"
        );
        self.version
    }

    fn record_change(&mut self, node: NodeId, from: Option<MemberStatus>, to: MemberStatus) {
        if self.changes.len() == MEMBERSHIP_CHANGE_LOG_LIMIT {
            self.changes.pop_front();
        }
        self.changes.push_back(MembershipChange {
            version: self.version,
            node,
            from,
            to,
        });
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        MembershipSnapshot {
            version: self.version,
            members: self.members.clone(),
        }
    }

    pub fn changes(&self) -> impl Iterator<Item = &MembershipChange> {
        self.changes.iter()
    }

    pub fn members(&self) -> impl Iterator<Item = (NodeId, MemberStatus)> + '_ {
        self.members.iter().map(|(n, r)| (*n, r.status))
    }

    pub fn active_members(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|(_, r)| r.status == MemberStatus::Active)
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.members
            .values()
            .filter(|r| r.status == MemberStatus::Active)
            .count()
    }

    /// Strict majority of the Active members.
    pub fn quorum_size(&self) -> usize {
        self.active_count() / 2 + 1
    }

    /// Members that have not failed or left.
    pub fn quorum_base(&self) -> usize {
        self.members
            .values()
            .filter(|r| r.status.counts_toward_quorum())
            .count()
    }

    /// True when Active members are a strict majority of the quorum base.
    ///
    /// A partitioned minority that has suspected the other side still counts
    /// those peers in the base and therefore cannot claim quorum.
    pub fn has_quorum(&self) -> bool {
        let active = self.active_count();
        active > 0 && active > self.quorum_base() / 2
    }

    /// Error describing the current quorum shortfall.
    pub fn quorum_error(&self) -> CoordError {
        CoordError::QuorumUnavailable {
            required: self.quorum_base() / 2 + 1,
            available: self.active_count(),
        }
    }

    /// Merge a remote snapshot, keeping the newer record per member.
    ///
    /// Returns true if anything changed locally. `self_id`'s own entry is
    /// never downgraded by a remote view; the node re-asserts itself instead.
    pub fn merge(&mut self, remote: &MembershipSnapshot, self_id: NodeId) -> bool {
        let mut changed = Vec::new();
        for (node, record) in &remote.members {
            if *node == self_id {
                continue;
            }
            let newer = match self.members.get(node) {
                None => true,
                Some(local) => record.supersedes(local),
            };
            if newer {
                let from = self.status_of(*node);
                if from != Some(record.status) {
                    changed.push((*node, from, record.status));
                }
                self.members.insert(*node, *record);
            }
        }
        if changed.is_empty() {
            // same entries under a newer version: adopt it so gossip settles
            self.version = self.version.max(remote.version);
            return false;
        }

        self.version = self.version.next().max(remote.version);
        for (node, from, to) in changed {
            self.record_change(node, from, to);
        }
        debug!(
            version = %self.version,
            remote_version = %remote.version,
            "Merged remote membership view"
        );
        true
    }
}
