//! Vector clocks for causal ordering of coordination events.
//!
//! Every envelope leaving an engine carries the sender's clock right after a
//! local tick, and every inbound envelope is merged (entrywise max, then tick)
//! before it is dispatched. As a result, if event `e1` causally precedes `e2`
//! then `compare(clock(e1), clock(e2))` is always [`CausalOrdering::Before`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Per-node logical clock.
///
/// Entries that are absent are treated as zero, so clocks over different node
/// sets compare correctly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    /// Create an empty vector clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from explicit `(node, counter)` pairs.
    #[must_use]
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, u64)>,
    {
        Self {
            entries: entries.into_iter().filter(|(_, c)| *c > 0).collect(),
        }
    }

    /// Increment the entry for `node`.
    pub fn increment(&mut self, node: NodeId) {
        *self.entries.entry(node).or_insert(0) += 1;
    }

    /// Merge another clock into this one, keeping the maximum for each node.
    pub fn merge(&mut self, other: &Self) {
        for (node, &counter) in &other.entries {
            let entry = self.entries.entry(*node).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Counter for `node` (zero if never seen).
    #[must_use]
    pub fn get(&self, node: NodeId) -> u64 {
        self.entries.get(&node).copied().unwrap_or(0)
    }

    /// Sum of all entries.
    ///
    /// Strictly increases along every causal chain, which makes it usable as a
    /// scalar component of a total order that respects causality.
    #[must_use]
    pub fn weight(&self) -> u64 {
        self.entries.values().sum()
    }

    /// Iterate over non-zero entries in node order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.entries.iter().map(|(n, c)| (*n, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compare two clocks to determine their causal relationship.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrdering {
        compare(self, other)
    }
}

/// Relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CausalOrdering {
    /// The left clock happened-before the right one.
    Before,
    /// The left clock happened-after the right one.
    After,
    /// Neither clock dominates.
    Concurrent,
    /// Clocks are identical.
    Equal,
}

/// Compare `a` against `b` entrywise.
#[must_use]
pub fn compare(a: &VectorClock, b: &VectorClock) -> CausalOrdering {
    let mut less = false;
    let mut greater = false;

    let mut left = a.entries.iter().peekable();
    let mut right = b.entries.iter().peekable();
    loop {
        let peeked = (
            left.peek().map(|(n, c)| (**n, **c)),
            right.peek().map(|(n, c)| (**n, **c)),
        );
        let (l, r) = match peeked {
            (None, None) => break,
            (Some((ln, lc)), Some((rn, rc))) => match ln.cmp(&rn) {
                Ordering::Less => {
                    left.next();
                    (lc, 0)
                }
                Ordering::Greater => {
                    right.next();
                    (0, rc)
                }
                Ordering::Equal => {
                    left.next();
                    right.next();
                    (lc, rc)
                }
            },
            (Some((_, lc)), None) => {
                left.next();
                (lc, 0)
            }
            (None, Some((_, rc))) => {
                right.next();
                (0, rc)
            }
        };
        if l < r {
            less = true;
        } else if l > r {
            greater = true;
        }
        if less && greater {
            return CausalOrdering::Concurrent;
        }
    }

    match (less, greater) {
        (false, false) => CausalOrdering::Equal,
        (true, false) => CausalOrdering::Before,
        (false, true) => CausalOrdering::After,
        (true, true) => CausalOrdering::Concurrent,
    }
}

/// Total order over `(timestamp, node)` pairs that is consistent with
/// causality.
///
/// Causally ordered stamps compare by causality. Concurrent or equal stamps
/// fall back to clock weight and then to [`NodeId`]. Because causal precedence
/// implies strictly smaller weight, this is the same as ordering by
/// `(weight, node)`, which keeps the relation transitive.
#[must_use]
pub fn request_order(a: (&VectorClock, NodeId), b: (&VectorClock, NodeId)) -> Ordering {
    match compare(a.0, b.0) {
        CausalOrdering::Before => Ordering::Less,
        CausalOrdering::After => Ordering::Greater,
        CausalOrdering::Concurrent | CausalOrdering::Equal => a
            .0
            .weight()
            .cmp(&b.0.weight())
            .then_with(|| a.1.cmp(&b.1)),
    }
}

/// The clock owned by one engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalClock {
    owner: NodeId,
    clock: VectorClock,
}

impl LocalClock {
    pub fn new(owner: NodeId) -> Self {
        Self {
            owner,
            clock: VectorClock::new(),
        }
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Record a local event and return the new clock.
    pub fn tick(&mut self) -> VectorClock {
        self.clock.increment(self.owner);
        self.clock.clone()
    }

    /// Record the receipt of a message stamped with `received`.
    ///
    /// Takes the entrywise maximum, then ticks.
    pub fn merge(&mut self, received: &VectorClock) -> VectorClock {
        let own = self.clock.get(self.owner);
        self.clock.merge(received);
        // a peer can never legitimately know more about our own counter
        if self.clock.get(self.owner) > own {
            tracing::warn!(
                node = %self.owner,
                local = own,
                received = received.get(self.owner),
                "Received clock is ahead of our own entry"
            );
        }
        self.tick()
    }

    /// Current clock without advancing it.
    pub fn current(&self) -> &VectorClock {
        &self.clock
    }

    /// Replace the clock (checkpoint restore).
    ///
    /// The own entry is never moved backwards.
    pub fn reset_to(&mut self, clock: VectorClock) {
        let own = self.clock.get(self.owner);
        self.clock = clock;
        if self.clock.get(self.owner) < own {
            self.clock.entries.insert(self.owner, own);
        }
    }
}

/// One event in the causal history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalEvent {
    pub clock: VectorClock,
    pub origin: NodeId,
    pub description: String,
}

/// Bounded log of causally stamped events.
#[derive(Debug, Clone)]
pub struct CausalHistory {
    events: VecDeque<CausalEvent>,
    limit: usize,
}

impl CausalHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            events: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn record(&mut self, origin: NodeId, clock: VectorClock, description: impl Into<String>) {
        if self.events.len() == self.limit {
            self.events.pop_front();
        }
        self.events.push_back(CausalEvent {
            clock,
            origin,
            description: description.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events in an order that never places an effect before its cause.
    pub fn ordered(&self) -> Vec<CausalEvent> {
        let mut events: Vec<_> = self.events.iter().cloned().collect();
        events.sort_by(|a, b| request_order((&a.clock, a.origin), (&b.clock, b.origin)));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(u64, u64)]) -> VectorClock {
        VectorClock::from_entries(pairs.iter().map(|(n, c)| (NodeId(*n), *c)))
    }

    #[test]
    fn detects_concurrent_clocks() {
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.increment(NodeId(1));
        b.increment(NodeId(2));
        assert_eq!(a.compare(&b), CausalOrdering::Concurrent);
    }

    #[test]
    fn test_compare_all_relations() {
        let a = clock(&[(1, 1)]);
        let b = clock(&[(1, 2), (2, 1)]);
        assert_eq!(compare(&a, &b), CausalOrdering::Before);
        assert_eq!(compare(&b, &a), CausalOrdering::After);
        assert_eq!(compare(&a, &a.clone()), CausalOrdering::Equal);
        assert_eq!(
            compare(&VectorClock::new(), &VectorClock::new()),
            CausalOrdering::Equal
        );
    }

    #[test]
    fn test_compare_interleaved_entries() {
        // each side has entries the other lacks, before, between and after
        let a = clock(&[(1, 2), (3, 1), (5, 4)]);
        let b = clock(&[(1, 2), (2, 1), (3, 1), (4, 7), (5, 4), (6, 1)]);
        assert_eq!(compare(&a, &b), CausalOrdering::Before);
        assert_eq!(compare(&b, &a), CausalOrdering::After);

        let c = clock(&[(2, 1), (7, 1)]);
        let d = clock(&[(1, 1), (7, 1)]);
        assert_eq!(compare(&c, &d), CausalOrdering::Concurrent);
    }

    #[test]
    fn test_missing_entries_count_as_zero() {
        let a = clock(&[(1, 1), (3, 0)]);
        let b = clock(&[(1, 1)]);
        assert_eq!(compare(&a, &b), CausalOrdering::Equal);
    }

    #[test]
    fn test_merge_then_tick() {
        let mut local = LocalClock::new(NodeId(1));
        local.tick();
        let received = clock(&[(1, 1), (2, 4)]);
        let merged = local.merge(&received);
        assert_eq!(merged.get(NodeId(1)), 2);
        assert_eq!(merged.get(NodeId(2)), 4);
        assert_eq!(compare(&received, &merged), CausalOrdering::Before);
    }

    #[test]
    fn test_message_chain_is_causally_ordered() {
        let mut a = LocalClock::new(NodeId(1));
        let mut b = LocalClock::new(NodeId(2));
        let mut c = LocalClock::new(NodeId(3));

        let e1 = a.tick();
        let e2 = b.merge(&e1);
        let e3 = b.tick();
        let e4 = c.merge(&e3);

        assert_eq!(compare(&e1, &e2), CausalOrdering::Before);
        assert_eq!(compare(&e1, &e4), CausalOrdering::Before);
        assert_eq!(compare(&e4, &e1), CausalOrdering::After);
    }

    #[test]
    fn test_tie_break_by_node_id_for_concurrent_requests() {
        let a = clock(&[(1, 1)]);
        let b = clock(&[(2, 1)]);
        assert_eq!(
            request_order((&a, NodeId(1)), (&b, NodeId(2))),
            Ordering::Less
        );
        assert_eq!(
            request_order((&b, NodeId(2)), (&a, NodeId(1))),
            Ordering::Greater
        );
    }

    #[test]
    fn test_causal_precedence_beats_node_id() {
        let early = clock(&[(9, 1)]);
        let late = clock(&[(9, 1), (1, 1)]);
        assert_eq!(
            request_order((&early, NodeId(9)), (&late, NodeId(1))),
            Ordering::Less
        );
    }

    #[test]
    fn test_reset_never_moves_own_entry_backwards() {
        let mut local = LocalClock::new(NodeId(1));
        for _ in 0..5 {
            local.tick();
        }
        local.reset_to(clock(&[(1, 2), (2, 7)]));
        assert_eq!(local.current().get(NodeId(1)), 5);
        assert_eq!(local.current().get(NodeId(2)), 7);
    }

    #[test]
    fn test_history_is_bounded_and_ordered() {
        let mut history = CausalHistory::new(3);
        let mut a = LocalClock::new(NodeId(1));
        for i in 0..5 {
            let c = a.tick();
            history.record(NodeId(1), c, format!("event {}", i));
        }
        assert_eq!(history.len(), 3);
        let ordered = history.ordered();
        assert_eq!(ordered[0].description, "event 2");
        assert_eq!(ordered[2].description, "event 4");
    }
}
