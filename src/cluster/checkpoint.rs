//! Checkpoints and chain replication.
//!
//! A checkpoint captures membership, the election term and resource ownership
//! as one immutable record with a CRC-32C digest over its encoded state. The
//! origin pushes it down the configured replica chain head to tail: each
//! replica verifies the digest, stores the copy durably, acks the origin and
//! forwards to its successor. The checkpoint commits once every live replica
//! has acked. Only one checkpoint may be replicating at a time.
//!
//! The chain is also the read path. A node with no usable local checkpoint
//! asks its live replicas for their copy, tail first, and adopts the first
//! copy that verifies.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::membership::MembershipSnapshot;
use crate::cluster::suzuki_kasami::Token;
use crate::cluster::vector_clock::VectorClock;
use crate::error::{CoordError, Result};
use crate::protocol::{crc32c, Message, Outbound};
use crate::types::{CheckpointSeq, NodeId, Term};

/// Resources held locally and tokens resting here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOwnership {
    pub held: BTreeSet<String>,
    pub tokens: BTreeMap<String, Token>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub membership: MembershipSnapshot,
    pub term: Term,
    pub ownership: ResourceOwnership,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: CheckpointSeq,
    pub state: CheckpointState,
    /// Clock at capture. Not covered by the digest.
    pub clock: VectorClock,
    pub digest: u32,
}

impl Checkpoint {
    pub fn seal(sequence: CheckpointSeq, state: CheckpointState, clock: VectorClock) -> Result<Self> {
        let digest = state_digest(&state)?;
        Ok(Self {
            sequence,
            state,
            clock,
            digest,
        })
    }

    pub fn verify(&self) -> Result<()> {
        let actual = state_digest(&self.state)?;
        if actual != self.digest {
            return Err(CoordError::Malformed(format!(
                "checkpoint {} digest mismatch: expected {:#010x}, got {:#010x}",
                self.sequence, self.digest, actual
            )));
        }
        Ok(())
    }
}

pub fn state_digest(state: &CheckpointState) -> Result<u32> {
    Ok(crc32c(&bincode::serialize(state)?))
}

/// Summary of a committed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub sequence: CheckpointSeq,
    pub digest: u32,
    pub term: Term,
    pub members: usize,
}

impl From<&Checkpoint> for CheckpointInfo {
    fn from(c: &Checkpoint) -> Self {
        Self {
            sequence: c.sequence,
            digest: c.digest,
            term: c.state.term,
            members: c.state.membership.members.len(),
        }
    }
}

#[derive(Debug)]
struct InFlight {
    checkpoint: Checkpoint,
    route: Vec<NodeId>,
    awaiting: BTreeSet<NodeId>,
}

/// Result of [`ReplicationLog::begin`].
#[derive(Debug)]
pub struct ReplicationStart {
    pub checkpoint: Checkpoint,
    pub outbound: Vec<Outbound>,
    /// True when no live replica remained and the checkpoint committed locally.
    pub committed: bool,
}

/// What a replica does with a received checkpoint, once the copy is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStep {
    pub ack: Outbound,
    pub forward: Option<Outbound>,
    /// Older copies for the same origin dropped by retention.
    pub evicted: Vec<CheckpointSeq>,
}

#[derive(Debug)]
pub struct ReplicationLog {
    id: NodeId,
    chain: Vec<NodeId>,
    retention: usize,
    next_sequence: CheckpointSeq,
    committed: BTreeMap<CheckpointSeq, Checkpoint>,
    in_flight: Option<InFlight>,
    replicas: BTreeMap<NodeId, BTreeMap<CheckpointSeq, Checkpoint>>,
}

impl ReplicationLog {
    pub fn new(id: NodeId, chain: Vec<NodeId>, retention: usize) -> Self {
        Self {
            id,
            chain,
            retention: retention.max(1),
            next_sequence: CheckpointSeq(1),
            committed: BTreeMap::new(),
            in_flight: None,
            replicas: BTreeMap::new(),
        }
    }

    pub fn chain(&self) -> &[NodeId] {
        &self.chain
    }

    /// Load committed checkpoints recovered from storage.
    pub fn load(&mut self, checkpoints: impl IntoIterator<Item = Checkpoint>, next_sequence: CheckpointSeq) {
        for checkpoint in checkpoints {
            self.committed.insert(checkpoint.sequence, checkpoint);
        }
        let after_last = self
            .committed
            .keys()
            .next_back()
            .map(|s| s.next())
            .unwrap_or(CheckpointSeq(1));
        self.next_sequence = next_sequence.max(after_last);
        self.prune();
    }

    /// Load replica copies recovered from storage, keyed by origin.
    pub fn load_replicas(&mut self, replicas: impl IntoIterator<Item = (NodeId, Vec<Checkpoint>)>) {
        for (origin, checkpoints) in replicas {
            let copies = self.replicas.entry(origin).or_default();
            for checkpoint in checkpoints {
                copies.insert(checkpoint.sequence, checkpoint);
            }
            while copies.len() > self.retention {
                copies.pop_first();
            }
        }
    }

    /// Seal `state` under the next sequence and start replicating it.
    ///
    /// Replicas for which `is_live` is false (Failed or Left) are skipped.
    pub fn begin(
        &mut self,
        state: CheckpointState,
        clock: VectorClock,
        is_live: impl Fn(NodeId) -> bool,
    ) -> Result<ReplicationStart> {
        if let Some(in_flight) = &self.in_flight {
            return Err(CoordError::CheckpointInProgress(in_flight.checkpoint.sequence));
        }

        let sequence = self.next_sequence;
        self.next_sequence = sequence.next();
        let checkpoint = Checkpoint::seal(sequence, state, clock)?;

        let route: Vec<NodeId> = self
            .chain
            .iter()
            .copied()
            .filter(|n| *n != self.id && is_live(*n))
            .collect();

        let Some(&head) = route.first() else {
            info!(sequence = %sequence, digest = checkpoint.digest, "Checkpoint committed without replicas");
            self.commit(checkpoint.clone());
            return Ok(ReplicationStart {
                checkpoint,
                outbound: Vec::new(),
                committed: true,
            });
        };

        debug!(sequence = %sequence, route = ?route, "Replicating checkpoint");
        let outbound = vec![Outbound::new(
            head,
            Message::CheckpointReplicate {
                origin: self.id,
                checkpoint: checkpoint.clone(),
                route: route.clone(),
            },
        )];
        self.in_flight = Some(InFlight {
            checkpoint: checkpoint.clone(),
            awaiting: route.iter().copied().collect(),
            route,
        });
        Ok(ReplicationStart {
            checkpoint,
            outbound,
            committed: false,
        })
    }

    /// Verify and store a replica copy.
    ///
    /// The caller persists the copy before sending the returned ack.
    pub fn handle_replicate(
        &mut self,
        origin: NodeId,
        checkpoint: Checkpoint,
        route: &[NodeId],
    ) -> Result<ReplicaStep> {
        checkpoint.verify()?;
        let sequence = checkpoint.sequence;

        let forward = route
            .iter()
            .position(|n| *n == self.id)
            .and_then(|pos| route.get(pos + 1))
            .map(|next| {
                Outbound::new(
                    *next,
                    Message::CheckpointReplicate {
                        origin,
                        checkpoint: checkpoint.clone(),
                        route: route.to_vec(),
                    },
                )
            });

        let copies = self.replicas.entry(origin).or_default();
        copies.insert(sequence, checkpoint);
        let mut evicted = Vec::new();
        while copies.len() > self.retention {
            if let Some((old, _)) = copies.pop_first() {
                evicted.push(old);
            }
        }

        Ok(ReplicaStep {
            ack: Outbound::new(
                origin,
                Message::CheckpointAck {
                    sequence,
                    replica: self.id,
                },
            ),
            forward,
            evicted,
        })
    }

    /// Record an ack. Returns the checkpoint if this ack committed it.
    pub fn handle_ack(&mut self, sequence: CheckpointSeq, replica: NodeId) -> Option<Checkpoint> {
        let in_flight = self.in_flight.as_mut()?;
        if in_flight.checkpoint.sequence != sequence {
            debug!(sequence = %sequence, replica = %replica, "Ack for checkpoint not in flight");
            return None;
        }
        in_flight.awaiting.remove(&replica);
        if !in_flight.awaiting.is_empty() {
            return None;
        }
        let in_flight = self.in_flight.take()?;
        info!(sequence = %sequence, digest = in_flight.checkpoint.digest, "Checkpoint committed");
        self.commit(in_flight.checkpoint.clone());
        Some(in_flight.checkpoint)
    }

    /// A replica left the live set; stop waiting for it.
    pub fn replica_departed(&mut self, replica: NodeId) -> Option<Checkpoint> {
        let sequence = self.in_flight.as_ref()?.checkpoint.sequence;
        self.handle_ack(sequence, replica)
    }

    /// Abort the in-flight checkpoint `sequence`.
    ///
    /// Returns the error naming the first replica in chain order that did not
    /// ack, or `None` if the checkpoint is no longer in flight.
    pub fn timeout(&mut self, sequence: CheckpointSeq) -> Option<CoordError> {
        if self.in_flight.as_ref()?.checkpoint.sequence != sequence {
            return None;
        }
        let in_flight = self.in_flight.take()?;
        let replica = in_flight
            .route
            .iter()
            .copied()
            .find(|n| in_flight.awaiting.contains(n))?;
        warn!(sequence = %sequence, replica = %replica, "Checkpoint replication timed out");
        Some(CoordError::ReplicationTimeout { sequence, replica })
    }

    fn commit(&mut self, checkpoint: Checkpoint) {
        self.committed.insert(checkpoint.sequence, checkpoint);
        self.prune();
    }

    fn prune(&mut self) {
        while self.committed.len() > self.retention {
            self.committed.pop_first();
        }
    }

    /// Newest committed checkpoint with sequence `<= sequence`.
    pub fn latest_at_or_below(&self, sequence: CheckpointSeq) -> Result<&Checkpoint> {
        self.committed
            .range(..=sequence)
            .next_back()
            .map(|(_, c)| c)
            .ok_or(CoordError::CheckpointNotFound(sequence))
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.committed.values().next_back()
    }

    pub fn committed(&self) -> impl Iterator<Item = &Checkpoint> {
        self.committed.values()
    }

    pub fn committed_count(&self) -> usize {
        self.committed.len()
    }

    pub fn in_flight(&self) -> Option<CheckpointSeq> {
        self.in_flight.as_ref().map(|f| f.checkpoint.sequence)
    }

    pub fn next_sequence(&self) -> CheckpointSeq {
        self.next_sequence
    }

    /// Replicas to ask for a lost checkpoint, tail first.
    pub fn fetch_route(&self, is_live: impl Fn(NodeId) -> bool) -> Vec<NodeId> {
        self.chain
            .iter()
            .rev()
            .copied()
            .filter(|n| *n != self.id && is_live(*n))
            .collect()
    }

    /// Newest copy held for `origin` with sequence `<= sequence`.
    pub fn replica_at_or_below(&self, origin: NodeId, sequence: CheckpointSeq) -> Option<&Checkpoint> {
        self.replicas
            .get(&origin)?
            .range(..=sequence)
            .next_back()
            .map(|(_, c)| c)
    }

    /// Take a copy fetched back from a replica as committed.
    ///
    /// Later checkpoints are sequenced after it.
    pub fn adopt(&mut self, checkpoint: Checkpoint) -> Result<()> {
        checkpoint.verify()?;
        self.next_sequence = self.next_sequence.max(checkpoint.sequence.next());
        info!(sequence = %checkpoint.sequence, digest = checkpoint.digest, "Adopted checkpoint from replica");
        self.commit(checkpoint);
        Ok(())
    }

    /// Copies this node holds as a replica for `origin`.
    pub fn replica_copies(&self, origin: NodeId) -> Vec<&Checkpoint> {
        self.replicas
            .get(&origin)
            .map(|c| c.values().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::MembershipStore;

    fn state(term: u64) -> CheckpointState {
        CheckpointState {
            membership: MembershipStore::with_seeds([NodeId(1), NodeId(2), NodeId(3)]).snapshot(),
            term: Term(term),
            ownership: ResourceOwnership::default(),
        }
    }

    fn live(_: NodeId) -> bool {
        true
    }

    #[test]
    fn test_digest_is_deterministic() {
        let a = Checkpoint::seal(CheckpointSeq(1), state(2), VectorClock::new()).unwrap();
        let b = Checkpoint::seal(CheckpointSeq(9), state(2), VectorClock::new()).unwrap();
        assert_eq!(a.digest, b.digest);
        assert!(a.verify().is_ok());

        let mut tampered = a.clone();
        tampered.state.term = Term(3);
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn test_chain_replication_commits_after_all_acks() {
        let mut origin = ReplicationLog::new(NodeId(1), vec![NodeId(2), NodeId(3)], 4);
        let mut head = ReplicationLog::new(NodeId(2), vec![NodeId(2), NodeId(3)], 4);
        let mut tail = ReplicationLog::new(NodeId(3), vec![NodeId(2), NodeId(3)], 4);

        let start = origin.begin(state(1), VectorClock::new(), live).unwrap();
        assert!(!start.committed);
        let Message::CheckpointReplicate { checkpoint, route, .. } = start.outbound[0].message.clone() else {
            panic!("expected replicate");
        };
        assert_eq!(start.outbound[0].to, NodeId(2));

        let step = head.handle_replicate(NodeId(1), checkpoint.clone(), &route).unwrap();
        let forward = step.forward.unwrap();
        assert_eq!(forward.to, NodeId(3));
        assert!(origin.handle_ack(checkpoint.sequence, NodeId(2)).is_none());

        let step = tail.handle_replicate(NodeId(1), checkpoint.clone(), &route).unwrap();
        assert!(step.forward.is_none());
        assert_eq!(tail.replica_copies(NodeId(1)).len(), 1);

        let committed = origin.handle_ack(checkpoint.sequence, NodeId(3)).unwrap();
        assert_eq!(committed.sequence, CheckpointSeq(1));
        assert_eq!(origin.latest().unwrap().digest, checkpoint.digest);
    }

    #[test]
    fn test_one_checkpoint_in_flight() {
        let mut log = ReplicationLog::new(NodeId(1), vec![NodeId(2)], 4);
        log.begin(state(1), VectorClock::new(), live).unwrap();
        assert!(matches!(
            log.begin(state(1), VectorClock::new(), live),
            Err(CoordError::CheckpointInProgress(CheckpointSeq(1)))
        ));
    }

    #[test]
    fn test_dead_replicas_skipped() {
        let mut log = ReplicationLog::new(NodeId(1), vec![NodeId(2), NodeId(3)], 4);
        let start = log
            .begin(state(1), VectorClock::new(), |n| n != NodeId(2) && n != NodeId(3))
            .unwrap();
        assert!(start.committed);
        assert_eq!(log.committed_count(), 1);
    }

    #[test]
    fn test_timeout_names_first_unacked_replica() {
        let mut log = ReplicationLog::new(NodeId(1), vec![NodeId(2), NodeId(3)], 4);
        let start = log.begin(state(1), VectorClock::new(), live).unwrap();
        log.handle_ack(start.checkpoint.sequence, NodeId(2));

        let err = log.timeout(start.checkpoint.sequence).unwrap();
        assert!(matches!(
            err,
            CoordError::ReplicationTimeout { replica: NodeId(3), .. }
        ));
        assert!(log.in_flight().is_none());
        assert!(log.latest().is_none());

        // the next checkpoint takes a fresh sequence
        let next = log.begin(state(1), VectorClock::new(), live).unwrap();
        assert_eq!(next.checkpoint.sequence, CheckpointSeq(2));
    }

    #[test]
    fn test_latest_at_or_below_and_retention() {
        let mut log = ReplicationLog::new(NodeId(1), vec![], 2);
        for term in 1..=3 {
            log.begin(state(term), VectorClock::new(), live).unwrap();
        }
        assert_eq!(log.committed_count(), 2);
        assert_eq!(
            log.latest_at_or_below(CheckpointSeq(10)).unwrap().sequence,
            CheckpointSeq(3)
        );
        assert!(matches!(
            log.latest_at_or_below(CheckpointSeq(1)),
            Err(CoordError::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn test_replica_retention_reports_evictions() {
        let mut log = ReplicationLog::new(NodeId(2), vec![NodeId(2)], 2);
        for seq in 1..=2 {
            let checkpoint = Checkpoint::seal(CheckpointSeq(seq), state(seq), VectorClock::new()).unwrap();
            let step = log.handle_replicate(NodeId(1), checkpoint, &[NodeId(2)]).unwrap();
            assert!(step.evicted.is_empty());
        }
        let checkpoint = Checkpoint::seal(CheckpointSeq(3), state(3), VectorClock::new()).unwrap();
        let step = log.handle_replicate(NodeId(1), checkpoint, &[NodeId(2)]).unwrap();
        assert_eq!(step.evicted, vec![CheckpointSeq(1)]);
        assert_eq!(log.replica_copies(NodeId(1)).len(), 2);
    }

    #[test]
    fn test_fetch_from_replica_and_adopt() {
        let chain = vec![NodeId(2), NodeId(3)];
        let mut tail = ReplicationLog::new(NodeId(3), chain.clone(), 4);
        for seq in [1, 3] {
            let checkpoint = Checkpoint::seal(CheckpointSeq(seq), state(seq), VectorClock::new()).unwrap();
            tail.handle_replicate(NodeId(1), checkpoint, &chain).unwrap();
        }

        // a restarted origin lost everything
        let mut origin = ReplicationLog::new(NodeId(1), chain, 4);
        assert_eq!(origin.fetch_route(live), vec![NodeId(3), NodeId(2)]);
        assert_eq!(origin.fetch_route(|n| n != NodeId(3)), vec![NodeId(2)]);

        assert!(tail.replica_at_or_below(NodeId(1), CheckpointSeq(0)).is_none());
        assert!(tail.replica_at_or_below(NodeId(4), CheckpointSeq(9)).is_none());
        let copy = tail.replica_at_or_below(NodeId(1), CheckpointSeq(2)).unwrap().clone();
        assert_eq!(copy.sequence, CheckpointSeq(1));

        origin.adopt(copy.clone()).unwrap();
        assert_eq!(origin.latest_at_or_below(CheckpointSeq(2)).unwrap().digest, copy.digest);
        assert_eq!(origin.next_sequence(), CheckpointSeq(2));

        let mut tampered = tail.replica_at_or_below(NodeId(1), CheckpointSeq(3)).unwrap().clone();
        tampered.state.term = Term(99);
        assert!(origin.adopt(tampered).is_err());
        assert_eq!(origin.committed_count(), 1);
    }

    #[test]
    fn test_recovered_replicas_respect_retention() {
        let mut log = ReplicationLog::new(NodeId(3), vec![NodeId(3)], 2);
        let copies = (1..=3)
            .map(|seq| Checkpoint::seal(CheckpointSeq(seq), state(seq), VectorClock::new()).unwrap())
            .collect();
        log.load_replicas([(NodeId(1), copies)]);
        let held: Vec<_> = log.replica_copies(NodeId(1)).iter().map(|c| c.sequence).collect();
        assert_eq!(held, vec![CheckpointSeq(2), CheckpointSeq(3)]);
    }

    #[test]
    fn test_corrupt_replica_rejected() {
        let mut log = ReplicationLog::new(NodeId(2), vec![NodeId(2)], 4);
        let mut checkpoint = Checkpoint::seal(CheckpointSeq(1), state(1), VectorClock::new()).unwrap();
        checkpoint.digest ^= 1;
        assert!(log.handle_replicate(NodeId(1), checkpoint, &[NodeId(2)]).is_err());
        assert!(log.replica_copies(NodeId(1)).is_empty());
    }
}
