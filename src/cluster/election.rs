//! Leader election.
//!
//! [`ElectionCore`] is a sans-IO state machine: every input returns the
//! messages to send and the engine does the sending, stamping, timing and
//! persistence. The rules:
//!
//! - A node grants its vote iff the candidate's term is strictly greater than
//!   any term it has seen. Granting adopts the term, so a second candidate in
//!   the same term is always denied.
//! - A candidate wins on a strict majority of the Active members captured when
//!   it started the candidacy, itself included.
//! - A heartbeat from a lower term is rejected with [`CoordError::StaleTerm`];
//!   one from a higher term is adopted and the receiver reverts to Follower.
//! - Every node remembers which leader it recognised per term and rejects a
//!   heartbeat that claims the same term for a different leader.
//! - A leader that misses majority acknowledgement for `leader_ack_rounds`
//!   consecutive heartbeat rounds steps down.
//!
//! The vote guard (highest term voted in or adopted) survives checkpoint
//! restore, so rewinding the term can never produce a second vote.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::membership::{MemberStatus, MembershipStore};
use crate::error::{CoordError, Result};
use crate::protocol::{Message, Outbound};
use crate::types::{MembershipVersion, NodeId, Term};

/// Terms whose leader is remembered for conflict detection.
const LEADER_RECORD_LIMIT: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Read-only view of a node's election state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionState {
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader: Option<NodeId>,
}

/// The part of the election state that must survive a restart.
///
/// Written before any vote reply leaves the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedElection {
    pub term: Term,
    pub vote_guard: Term,
    pub voted_for: Option<NodeId>,
}

#[derive(Debug)]
pub struct ElectionCore {
    id: NodeId,
    role: Role,
    term: Term,
    vote_guard: Term,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    leaders_by_term: BTreeMap<Term, NodeId>,
    electorate: BTreeSet<NodeId>,
    votes: BTreeSet<NodeId>,
    acks: BTreeSet<NodeId>,
    round_open: bool,
    missed_ack_rounds: u32,
    leader_ack_rounds: u32,
}

impl ElectionCore {
    pub fn new(id: NodeId, leader_ack_rounds: u32) -> Self {
        Self {
            id,
            role: Role::Follower,
            term: Term::ZERO,
            vote_guard: Term::ZERO,
            voted_for: None,
            leader: None,
            leaders_by_term: BTreeMap::new(),
            electorate: BTreeSet::new(),
            votes: BTreeSet::new(),
            acks: BTreeSet::new(),
            round_open: false,
            missed_ack_rounds: 0,
            leader_ack_rounds: leader_ack_rounds.max(1),
        }
    }

    /// Resume from persisted state. The node always restarts as Follower.
    pub fn from_persisted(id: NodeId, leader_ack_rounds: u32, persisted: PersistedElection) -> Self {
        let mut core = Self::new(id, leader_ack_rounds);
        core.term = persisted.term;
        core.vote_guard = persisted.vote_guard.max(persisted.term);
        core.voted_for = persisted.voted_for;
        core
    }

    pub fn state(&self) -> ElectionState {
        ElectionState {
            role: self.role,
            term: self.term,
            voted_for: self.voted_for,
            leader: self.leader,
        }
    }

    pub fn persisted(&self) -> PersistedElection {
        PersistedElection {
            term: self.term,
            vote_guard: self.vote_guard,
            voted_for: self.voted_for,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// The highest term this node has voted in or adopted.
    fn highest_seen(&self) -> Term {
        self.term.max(self.vote_guard)
    }

    /// Begin a candidacy.
    ///
    /// Fails with [`CoordError::QuorumUnavailable`] when the Active members are
    /// not a majority of the quorum base. A single-member electorate wins
    /// immediately.
    pub fn start_election(&mut self, membership: &MembershipStore) -> Result<Vec<Outbound>> {
        if self.role == Role::Leader {
            return Ok(Vec::new());
        }
        if !membership.is_active(self.id) {
            return Err(CoordError::InvalidTransition {
                node: self.id,
                from: membership.status_of(self.id).unwrap_or(MemberStatus::Left),
                to: MemberStatus::Active,
            });
        }
        if !membership.has_quorum() {
            return Err(membership.quorum_error());
        }

        let term = self.highest_seen().next();
        self.term = term;
        self.vote_guard = term;
        self.voted_for = Some(self.id);
        self.role = Role::Candidate;
        self.leader = None;
        self.electorate = membership.active_members().into_iter().collect();
        self.electorate.insert(self.id);
        self.votes.clear();
        self.votes.insert(self.id);

        info!(
            node = %self.id,
            term = %term,
            electorate = self.electorate.len(),
            "Starting election"
        );

        if self.has_vote_majority() {
            return Ok(self.become_leader(membership.version()));
        }

        let peers: Vec<NodeId> = self
            .electorate
            .iter()
            .copied()
            .filter(|n| *n != self.id)
            .collect();
        Ok(Outbound::broadcast(
            peers,
            Message::VoteRequest {
                term,
                membership_version: membership.version(),
            },
        ))
    }

    fn has_vote_majority(&self) -> bool {
        self.votes.len() > self.electorate.len() / 2
    }

    fn become_leader(&mut self, membership_version: MembershipVersion) -> Vec<Outbound> {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.record_leader(self.term, self.id);
        self.acks.clear();
        self.round_open = true;
        self.missed_ack_rounds = 0;
        info!(node = %self.id, term = %self.term, votes = self.votes.len(), "Became leader");

        let peers: Vec<NodeId> = self
            .electorate
            .iter()
            .copied()
            .filter(|n| *n != self.id)
            .collect();
        Outbound::broadcast(
            peers,
            Message::Heartbeat {
                term: self.term,
                membership_version,
            },
        )
    }

    fn record_leader(&mut self, term: Term, leader: NodeId) {
        self.leaders_by_term.insert(term, leader);
        while self.leaders_by_term.len() > LEADER_RECORD_LIMIT {
            self.leaders_by_term.pop_first();
        }
    }

    fn step_down(&mut self, term: Term) {
        if term > self.term {
            self.term = term;
            if term > self.vote_guard {
                self.vote_guard = term;
                self.voted_for = None;
            }
        }
        if self.role != Role::Follower {
            debug!(node = %self.id, term = %self.term, role = %self.role, "Stepping down");
        }
        self.role = Role::Follower;
        if self.leaders_by_term.get(&self.term) != self.leader.as_ref() {
            self.leader = None;
        }
        self.votes.clear();
        self.acks.clear();
        self.round_open = false;
    }

    pub fn handle_vote_request(
        &mut self,
        from: NodeId,
        term: Term,
        membership_version: MembershipVersion,
        membership: &MembershipStore,
    ) -> Vec<Outbound> {
        let eligible = membership.is_active(from);
        let granted = eligible && term > self.highest_seen();

        if granted {
            self.term = term;
            self.vote_guard = term;
            self.voted_for = Some(from);
            self.role = Role::Follower;
            self.leader = None;
            self.votes.clear();
            self.acks.clear();
            self.round_open = false;
        }

        debug!(
            node = %self.id,
            candidate = %from,
            candidate_term = %term,
            candidate_membership = %membership_version,
            granted,
            "Vote request"
        );

        vec![Outbound::new(
            from,
            Message::VoteReply {
                term: self.term,
                granted,
            },
        )]
    }

    pub fn handle_vote_reply(
        &mut self,
        from: NodeId,
        term: Term,
        granted: bool,
        membership: &MembershipStore,
    ) -> Vec<Outbound> {
        if term > self.term {
            self.step_down(term);
            return Vec::new();
        }
        if self.role != Role::Candidate || term != self.term || !granted {
            return Vec::new();
        }
        if !self.electorate.contains(&from) {
            return Vec::new();
        }
        self.votes.insert(from);
        if self.has_vote_majority() {
            return self.become_leader(membership.version());
        }
        Vec::new()
    }

    /// Accept or reject a leader heartbeat.
    pub fn handle_heartbeat(&mut self, from: NodeId, term: Term) -> Result<Vec<Outbound>> {
        if term < self.term {
            return Err(CoordError::StaleTerm {
                received: term,
                current: self.term,
            });
        }
        if let Some(known) = self.leaders_by_term.get(&term) {
            if *known != from {
                warn!(
                    node = %self.id,
                    term = %term,
                    recognised = %known,
                    claimed = %from,
                    "Conflicting leader for term"
                );
                return Err(CoordError::Malformed(format!(
                    "{} claims term {} already led by {}",
                    from, term, known
                )));
            }
        }

        if term > self.term || self.role != Role::Follower {
            self.step_down(term);
        }
        self.leader = Some(from);
        self.record_leader(term, from);

        Ok(vec![Outbound::new(from, Message::HeartbeatAck { term })])
    }

    pub fn handle_heartbeat_ack(&mut self, from: NodeId, term: Term) {
        if term > self.term {
            self.step_down(term);
            return;
        }
        if self.role == Role::Leader && term == self.term {
            self.acks.insert(from);
        }
    }

    /// Close the previous heartbeat round and open the next one.
    ///
    /// Returns the heartbeats to send, or nothing if this node is not (or is
    /// no longer) the leader.
    pub fn heartbeat_round(&mut self, membership: &MembershipStore) -> Vec<Outbound> {
        if self.role != Role::Leader {
            return Vec::new();
        }

        let active = membership.active_members();
        if self.round_open {
            let acked = active
                .iter()
                .filter(|n| **n == self.id || self.acks.contains(n))
                .count();
            if acked >= membership.quorum_size() && membership.has_quorum() {
                self.missed_ack_rounds = 0;
            } else {
                self.missed_ack_rounds += 1;
                debug!(
                    node = %self.id,
                    acked,
                    required = membership.quorum_size(),
                    missed_rounds = self.missed_ack_rounds,
                    "Heartbeat round without majority"
                );
            }
        }

        if self.missed_ack_rounds >= self.leader_ack_rounds {
            warn!(
                node = %self.id,
                term = %self.term,
                missed_rounds = self.missed_ack_rounds,
                "Leader lost majority acknowledgement, stepping down"
            );
            self.role = Role::Follower;
            self.leader = None;
            self.acks.clear();
            self.round_open = false;
            self.missed_ack_rounds = 0;
            return Vec::new();
        }

        self.acks.clear();
        self.round_open = true;
        let peers: Vec<NodeId> = active.into_iter().filter(|n| *n != self.id).collect();
        Outbound::broadcast(
            peers,
            Message::Heartbeat {
                term: self.term,
                membership_version: membership.version(),
            },
        )
    }

    /// A candidacy timed out without a majority.
    pub fn abandon_candidacy(&mut self) {
        if self.role == Role::Candidate {
            info!(node = %self.id, term = %self.term, votes = self.votes.len(), "Election timed out");
            self.role = Role::Follower;
            self.votes.clear();
        }
    }

    /// Forget a leader that left or failed.
    ///
    /// Returns true if the departed node was the recognised leader.
    pub fn leader_departed(&mut self, node: NodeId) -> bool {
        if node == self.id && self.role == Role::Leader {
            self.role = Role::Follower;
            self.leader = None;
            self.round_open = false;
            return true;
        }
        if self.leader == Some(node) {
            info!(node = %self.id, leader = %node, "Recognised leader departed");
            self.leader = None;
            return true;
        }
        false
    }

    /// Reset to a checkpointed term. The vote guard is kept.
    pub fn restore(&mut self, term: Term) {
        self.term = term;
        self.role = Role::Follower;
        self.leader = self.leaders_by_term.get(&term).copied();
        self.votes.clear();
        self.acks.clear();
        self.round_open = false;
        self.missed_ack_rounds = 0;
        if self.vote_guard < term {
            self.vote_guard = term;
            self.voted_for = None;
        }
    }
}
