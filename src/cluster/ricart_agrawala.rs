//! Ricart–Agrawala mutual exclusion.
//!
//! A requester broadcasts a timestamped request and enters the critical
//! section once every awaited peer has replied. A receiver replies at once
//! unless it holds the resource or wants it with an earlier
//! `(timestamp, node)` key, in which case the reply is deferred until release.
//!
//! Requests are ordered by [`request_order`], a total order consistent with
//! causality, so every node ranks two competing requests the same way.
//!
//! Every request carries a per-node sequence number. Replies and releases
//! name the sequence they answer, which makes duplicates and stale messages
//! from an earlier round harmless. A repeated request is answered again, and
//! the requester ignores replies it is no longer waiting for.
//!
//! The set of peers asked is not frozen at request time. A peer that becomes
//! Active later, or that sends us a competing request while we wait, is asked
//! too; otherwise a node outside our view could enter alongside us.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::cluster::vector_clock::{VectorClock, request_order};
use crate::error::{CoordError, Result};
use crate::protocol::{Message, Outbound};
use crate::types::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalState {
    Released,
    Wanted {
        timestamp: VectorClock,
        sequence: u64,
        /// Every peer our request went to.
        asked: BTreeSet<NodeId>,
        awaiting: BTreeSet<NodeId>,
    },
    Held {
        sequence: u64,
    },
}

#[derive(Debug, Clone)]
struct ResourceState {
    local: LocalState,
    /// Requests we owe a reply to, by requester, with their sequence.
    deferred: BTreeMap<NodeId, u64>,
}

impl Default for ResourceState {
    fn default() -> Self {
        Self {
            local: LocalState::Released,
            deferred: BTreeMap::new(),
        }
    }
}

/// Result of a local request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Sequence number assigned to the request.
    pub sequence: u64,
    /// True when the resource was granted without waiting (no peers).
    pub granted: bool,
    pub outbound: Vec<Outbound>,
}

#[derive(Debug)]
pub struct RicartAgrawala {
    id: NodeId,
    next_sequence: u64,
    resources: HashMap<String, ResourceState>,
    /// Highest request sequence seen per (peer, resource).
    seen: HashMap<(NodeId, String), u64>,
    /// Highest released or withdrawn sequence per (peer, resource).
    released: HashMap<(NodeId, String), u64>,
}

impl RicartAgrawala {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            next_sequence: 0,
            resources: HashMap::new(),
            seen: HashMap::new(),
            released: HashMap::new(),
        }
    }

    /// Ask every peer for permission.
    ///
    /// `peers` is the current Active membership without this node.
    pub fn request(
        &mut self,
        resource: &str,
        timestamp: VectorClock,
        peers: &[NodeId],
    ) -> Result<RequestOutcome> {
        let state = self.resources.entry(resource.to_string()).or_default();
        if state.local != LocalState::Released {
            return Err(CoordError::ResourceBusy {
                resource: resource.to_string(),
            });
        }

        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let awaiting: BTreeSet<NodeId> = peers.iter().copied().filter(|p| *p != self.id).collect();

        if awaiting.is_empty() {
            state.local = LocalState::Held { sequence };
            return Ok(RequestOutcome {
                sequence,
                granted: true,
                outbound: Vec::new(),
            });
        }

        let outbound = Outbound::broadcast(
            awaiting.iter().copied(),
            Message::ResourceRequest {
                resource: resource.to_string(),
                timestamp: timestamp.clone(),
                sequence,
            },
        );
        state.local = LocalState::Wanted {
            timestamp,
            sequence,
            asked: awaiting.clone(),
            awaiting,
        };
        Ok(RequestOutcome {
            sequence,
            granted: false,
            outbound,
        })
    }

    pub fn handle_request(
        &mut self,
        from: NodeId,
        resource: &str,
        timestamp: &VectorClock,
        sequence: u64,
    ) -> Vec<Outbound> {
        let key = (from, resource.to_string());
        match self.seen.get(&key) {
            Some(seen) if *seen > sequence => {
                debug!(node = %self.id, from = %from, resource, sequence, "Stale resource request");
                return Vec::new();
            }
            Some(seen) if *seen == sequence => {
                debug!(node = %self.id, from = %from, resource, sequence, "Repeated resource request");
            }
            _ => {
                self.seen.insert(key.clone(), sequence);
            }
        }
        if self.released.get(&key).is_some_and(|s| *s >= sequence) {
            // withdrawn before it reached us
            return Vec::new();
        }

        let id = self.id;
        let state = self.resources.entry(resource.to_string()).or_default();
        let mut outbound = Vec::new();
        let defer = match &mut state.local {
            LocalState::Held { .. } => true,
            LocalState::Wanted {
                timestamp: ours,
                sequence: our_sequence,
                asked,
                awaiting,
            } => {
                // a competitor we never asked must let us in too
                if from != id && asked.insert(from) {
                    debug!(node = %id, peer = %from, resource, "Asking unexpected competitor");
                    awaiting.insert(from);
                    outbound.push(Outbound::new(
                        from,
                        Message::ResourceRequest {
                            resource: resource.to_string(),
                            timestamp: ours.clone(),
                            sequence: *our_sequence,
                        },
                    ));
                }
                request_order((ours, id), (timestamp, from)) == Ordering::Less
            }
            LocalState::Released => false,
        };

        if defer {
            debug!(node = %id, from = %from, resource, sequence, "Deferring reply");
            state.deferred.insert(from, sequence);
        } else {
            outbound.push(Outbound::new(
                from,
                Message::ResourceReply {
                    resource: resource.to_string(),
                    sequence,
                },
            ));
        }
        outbound
    }

    /// Record a reply. Returns true if the resource is now held.
    pub fn handle_reply(&mut self, from: NodeId, resource: &str, sequence: u64) -> bool {
        let Some(state) = self.resources.get_mut(resource) else {
            return false;
        };
        let LocalState::Wanted {
            sequence: ours,
            awaiting,
            ..
        } = &mut state.local
        else {
            return false;
        };
        if *ours != sequence {
            debug!(node = %self.id, from = %from, resource, sequence, "Stale resource reply");
            return false;
        }
        awaiting.remove(&from);
        if awaiting.is_empty() {
            let seq = *ours;
            state.local = LocalState::Held { sequence: seq };
            return true;
        }
        false
    }

    /// A peer released the resource or withdrew its request.
    pub fn handle_release(&mut self, from: NodeId, resource: &str, sequence: u64) {
        let key = (from, resource.to_string());
        let entry = self.released.entry(key).or_insert(0);
        *entry = (*entry).max(sequence);

        if let Some(state) = self.resources.get_mut(resource) {
            if state.deferred.get(&from).is_some_and(|s| *s <= sequence) {
                state.deferred.remove(&from);
            }
        }
    }

    /// Leave the critical section, or withdraw a pending request.
    ///
    /// Deferred requesters get their replies and `peers` learn of the
    /// release. Releasing an idle resource is a no-op.
    pub fn release(&mut self, resource: &str, peers: &[NodeId]) -> Vec<Outbound> {
        let Some(state) = self.resources.get_mut(resource) else {
            return Vec::new();
        };
        let sequence = match &state.local {
            LocalState::Released => return Vec::new(),
            LocalState::Wanted { sequence, .. } | LocalState::Held { sequence } => *sequence,
        };
        state.local = LocalState::Released;

        let mut outbound: Vec<Outbound> = std::mem::take(&mut state.deferred)
            .into_iter()
            .map(|(to, seq)| {
                Outbound::new(
                    to,
                    Message::ResourceReply {
                        resource: resource.to_string(),
                        sequence: seq,
                    },
                )
            })
            .collect();
        outbound.extend(Outbound::broadcast(
            peers.iter().copied().filter(|p| *p != self.id),
            Message::ResourceRelease {
                resource: resource.to_string(),
                sequence,
            },
        ));
        outbound
    }

    /// A peer became Active: every pending request must also wait for it.
    pub fn peer_activated(&mut self, node: NodeId) -> Vec<Outbound> {
        if node == self.id {
            return Vec::new();
        }
        let mut outbound = Vec::new();
        for (name, state) in self.resources.iter_mut() {
            if let LocalState::Wanted {
                timestamp,
                sequence,
                asked,
                awaiting,
            } = &mut state.local
            {
                if asked.insert(node) {
                    awaiting.insert(node);
                    outbound.push(Outbound::new(
                        node,
                        Message::ResourceRequest {
                            resource: name.clone(),
                            timestamp: timestamp.clone(),
                            sequence: *sequence,
                        },
                    ));
                }
            }
        }
        outbound
    }

    /// Stop waiting for a peer that is no longer Active.
    ///
    /// Returns the resources that became held as a result.
    pub fn peer_departed(&mut self, node: NodeId) -> Vec<String> {
        let mut granted = Vec::new();
        for (name, state) in self.resources.iter_mut() {
            state.deferred.remove(&node);
            if let LocalState::Wanted {
                sequence,
                asked,
                awaiting,
                ..
            } = &mut state.local
            {
                // asked again should it come back
                asked.remove(&node);
                if awaiting.remove(&node) && awaiting.is_empty() {
                    let seq = *sequence;
                    state.local = LocalState::Held { sequence: seq };
                    granted.push(name.clone());
                }
            }
        }
        granted.sort();
        granted
    }

    pub fn holds(&self, resource: &str) -> bool {
        self.resources
            .get(resource)
            .is_some_and(|s| matches!(s.local, LocalState::Held { .. }))
    }

    pub fn is_pending(&self, resource: &str) -> bool {
        self.resources
            .get(resource)
            .is_some_and(|s| matches!(s.local, LocalState::Wanted { .. }))
    }

    pub fn held_resources(&self) -> BTreeSet<String> {
        self.resources
            .iter()
            .filter(|(_, s)| matches!(s.local, LocalState::Held { .. }))
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn pending_resources(&self) -> BTreeSet<String> {
        self.resources
            .iter()
            .filter(|(_, s)| matches!(s.local, LocalState::Wanted { .. }))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Reset ownership to a checkpoint: exactly `held` is held, nothing is
    /// pending and no replies are owed.
    pub fn restore(&mut self, held: &BTreeSet<String>) {
        self.resources.clear();
        for name in held {
            self.next_sequence += 1;
            self.resources.insert(
                name.clone(),
                ResourceState {
                    local: LocalState::Held {
                        sequence: self.next_sequence,
                    },
                    deferred: BTreeMap::new(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(u64, u64)]) -> VectorClock {
        VectorClock::from_entries(pairs.iter().map(|(n, c)| (NodeId(*n), *c)))
    }

    fn replies(out: &[Outbound]) -> Vec<NodeId> {
        out.iter()
            .filter(|o| matches!(o.message, Message::ResourceReply { .. }))
            .map(|o| o.to)
            .collect()
    }

    #[test]
    fn test_lone_node_is_granted_immediately() {
        let mut ra = RicartAgrawala::new(NodeId(1));
        let outcome = ra.request("db", clock(&[(1, 1)]), &[]).unwrap();
        assert!(outcome.granted);
        assert!(ra.holds("db"));
    }

    #[test]
    fn test_duplicate_local_request_is_busy() {
        let mut ra = RicartAgrawala::new(NodeId(1));
        ra.request("db", clock(&[(1, 1)]), &[NodeId(2)]).unwrap();
        assert!(matches!(
            ra.request("db", clock(&[(1, 2)]), &[NodeId(2)]),
            Err(CoordError::ResourceBusy { .. })
        ));
    }

    #[test]
    fn test_grant_after_all_replies() {
        let mut ra = RicartAgrawala::new(NodeId(1));
        let outcome = ra
            .request("db", clock(&[(1, 1)]), &[NodeId(2), NodeId(3)])
            .unwrap();
        assert_eq!(outcome.outbound.len(), 2);
        assert!(!ra.handle_reply(NodeId(2), "db", outcome.sequence));
        assert!(ra.handle_reply(NodeId(3), "db", outcome.sequence));
        assert!(ra.holds("db"));
    }

    #[test]
    fn test_idle_node_replies_immediately() {
        let mut ra = RicartAgrawala::new(NodeId(2));
        let out = ra.handle_request(NodeId(1), "db", &clock(&[(1, 1)]), 1);
        assert_eq!(replies(&out), vec![NodeId(1)]);
    }

    #[test]
    fn test_holder_defers_until_release() {
        let mut ra = RicartAgrawala::new(NodeId(2));
        ra.request("db", clock(&[(2, 1)]), &[]).unwrap();
        assert!(ra.handle_request(NodeId(1), "db", &clock(&[(1, 1)]), 1).is_empty());

        let out = ra.release("db", &[NodeId(1)]);
        assert_eq!(replies(&out), vec![NodeId(1)]);
        assert!(out
            .iter()
            .any(|o| matches!(o.message, Message::ResourceRelease { .. })));
    }

    #[test]
    fn test_concurrent_requests_tie_break_by_node_id() {
        // A = node 1 stamped [1,0], B = node 2 stamped [0,1]
        let mut a = RicartAgrawala::new(NodeId(1));
        let mut b = RicartAgrawala::new(NodeId(2));
        let ta = clock(&[(1, 1)]);
        let tb = clock(&[(2, 1)]);
        let ra = a.request("r", ta.clone(), &[NodeId(2)]).unwrap();
        let rb = b.request("r", tb.clone(), &[NodeId(1)]).unwrap();

        // A defers B's request, B replies to A's
        assert!(a.handle_request(NodeId(2), "r", &tb, rb.sequence).is_empty());
        let to_a = b.handle_request(NodeId(1), "r", &ta, ra.sequence);
        assert_eq!(replies(&to_a), vec![NodeId(1)]);

        assert!(a.handle_reply(NodeId(2), "r", ra.sequence));
        assert!(!b.holds("r"));

        let released = a.release("r", &[NodeId(2)]);
        assert_eq!(replies(&released), vec![NodeId(2)]);
        assert!(b.handle_reply(NodeId(1), "r", rb.sequence));
    }

    #[test]
    fn test_repeated_request_is_answered_again() {
        let mut ra = RicartAgrawala::new(NodeId(2));
        assert_eq!(replies(&ra.handle_request(NodeId(1), "db", &clock(&[(1, 2)]), 2)), vec![NodeId(1)]);
        assert_eq!(replies(&ra.handle_request(NodeId(1), "db", &clock(&[(1, 2)]), 2)), vec![NodeId(1)]);
        // an older round is dropped
        assert!(ra.handle_request(NodeId(1), "db", &clock(&[(1, 1)]), 1).is_empty());
    }

    #[test]
    fn test_repeated_request_stays_deferred() {
        let mut ra = RicartAgrawala::new(NodeId(2));
        ra.request("db", clock(&[(2, 1)]), &[]).unwrap();
        assert!(ra.handle_request(NodeId(1), "db", &clock(&[(1, 1)]), 1).is_empty());
        assert!(ra.handle_request(NodeId(1), "db", &clock(&[(1, 1)]), 1).is_empty());
        assert_eq!(replies(&ra.release("db", &[NodeId(1)])), vec![NodeId(1)]);
    }

    fn requests(out: &[Outbound]) -> Vec<NodeId> {
        out.iter()
            .filter(|o| matches!(o.message, Message::ResourceRequest { .. }))
            .map(|o| o.to)
            .collect()
    }

    #[test]
    fn test_late_activated_peer_is_awaited() {
        let mut a = RicartAgrawala::new(NodeId(1));
        let mut b = RicartAgrawala::new(NodeId(2));
        let mut c = RicartAgrawala::new(NodeId(3));
        // concurrent, but a's stamp is heavier, so c ranks first
        let ta = clock(&[(1, 2)]);
        let tc = clock(&[(3, 1)]);

        // c is still joining when a asks, so only b is asked
        let ra = a.request("r", ta.clone(), &[NodeId(2)]).unwrap();
        let rc = c.request("r", tc.clone(), &[NodeId(1), NodeId(2)]).unwrap();

        let asked = a.peer_activated(NodeId(3));
        assert_eq!(requests(&asked), vec![NodeId(3)]);
        assert!(a.peer_activated(NodeId(3)).is_empty());

        // c's earlier-ranked request gets its replies, a's waits on c
        assert_eq!(replies(&a.handle_request(NodeId(3), "r", &tc, rc.sequence)), vec![NodeId(3)]);
        assert_eq!(replies(&b.handle_request(NodeId(3), "r", &tc, rc.sequence)), vec![NodeId(3)]);
        assert!(c.handle_request(NodeId(1), "r", &ta, ra.sequence).is_empty());
        assert!(!c.handle_reply(NodeId(1), "r", rc.sequence));
        assert!(c.handle_reply(NodeId(2), "r", rc.sequence));

        let to_a = b.handle_request(NodeId(1), "r", &ta, ra.sequence);
        assert!(!a.handle_reply(NodeId(2), "r", ra.sequence));
        assert_eq!(replies(&to_a), vec![NodeId(1)]);
        assert!(!a.holds("r"), "entered while c holds");

        let released = c.release("r", &[NodeId(1), NodeId(2)]);
        assert_eq!(replies(&released), vec![NodeId(1)]);
        assert!(a.handle_reply(NodeId(3), "r", ra.sequence));
    }

    #[test]
    fn test_unexpected_competitor_is_asked() {
        let mut a = RicartAgrawala::new(NodeId(1));
        // concurrent, but a's stamp is heavier, so c ranks first
        let ta = clock(&[(1, 2)]);
        let tc = clock(&[(3, 1)]);
        let ra = a.request("r", ta, &[NodeId(2)]).unwrap();

        // node 3 is not in a's view yet, but it competes for the same resource
        let out = a.handle_request(NodeId(3), "r", &tc, 1);
        assert_eq!(replies(&out), vec![NodeId(3)]);
        assert_eq!(requests(&out), vec![NodeId(3)]);

        assert!(!a.handle_reply(NodeId(2), "r", ra.sequence));
        assert!(!a.holds("r"));
        assert!(a.handle_reply(NodeId(3), "r", ra.sequence));
    }

    #[test]
    fn test_stale_reply_is_ignored() {
        let mut ra = RicartAgrawala::new(NodeId(1));
        let first = ra.request("db", clock(&[(1, 1)]), &[NodeId(2)]).unwrap();
        ra.release("db", &[NodeId(2)]);
        let second = ra.request("db", clock(&[(1, 3)]), &[NodeId(2)]).unwrap();
        assert!(!ra.handle_reply(NodeId(2), "db", first.sequence));
        assert!(ra.handle_reply(NodeId(2), "db", second.sequence));
    }

    #[test]
    fn test_withdrawal_clears_deferred_entry() {
        let mut holder = RicartAgrawala::new(NodeId(2));
        holder.request("db", clock(&[(2, 1)]), &[]).unwrap();
        holder.handle_request(NodeId(1), "db", &clock(&[(1, 1)]), 1);
        holder.handle_release(NodeId(1), "db", 1);

        let out = holder.release("db", &[NodeId(1)]);
        assert!(replies(&out).is_empty());
    }

    #[test]
    fn test_withdrawn_request_arriving_late_is_ignored() {
        let mut ra = RicartAgrawala::new(NodeId(2));
        ra.handle_release(NodeId(1), "db", 4);
        assert!(ra.handle_request(NodeId(1), "db", &clock(&[(1, 4)]), 4).is_empty());
    }

    #[test]
    fn test_departed_peer_is_not_awaited() {
        let mut ra = RicartAgrawala::new(NodeId(1));
        let r = ra
            .request("db", clock(&[(1, 1)]), &[NodeId(2), NodeId(3)])
            .unwrap();
        ra.handle_reply(NodeId(2), "db", r.sequence);
        assert_eq!(ra.peer_departed(NodeId(3)), vec!["db".to_string()]);
        assert!(ra.holds("db"));
    }

    #[test]
    fn test_restore_sets_exact_ownership() {
        let mut ra = RicartAgrawala::new(NodeId(1));
        ra.request("a", clock(&[(1, 1)]), &[NodeId(2)]).unwrap();
        let held: BTreeSet<String> = ["b".to_string()].into_iter().collect();
        ra.restore(&held);
        assert!(ra.holds("b"));
        assert!(!ra.is_pending("a"));
        assert_eq!(ra.held_resources(), held);
    }
}
