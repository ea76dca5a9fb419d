//! Suzuki–Kasami token-based mutual exclusion.
//!
//! Each resource has a single [`Token`]. The holder of an idle token enters
//! the critical section without messaging; everyone else broadcasts a request
//! numbered by its own request counter and waits for the token to arrive.
//!
//! Every node keeps `RN[j]`, the highest request number seen from `j`. The
//! token carries `LN[j]`, the number of `j`'s last served request, and a FIFO
//! queue. On release the holder appends every `j` with `RN[j] == LN[j] + 1`
//! (ascending [`NodeId`]) that is not already queued, then hands the token to
//! the first Active node in the queue.
//!
//! Withdrawn requests are reconciled as served. Token transfers are numbered
//! so a duplicated delivery cannot create a second token. Each node remembers
//! the highest transfer number it has received or issued, and a checkpoint
//! restore brings back only tokens that have not been handed on since.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::vector_clock::VectorClock;
use crate::error::{CoordError, Result};
use crate::protocol::{Message, Outbound};
use crate::types::NodeId;

/// The access permit for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub resource: String,
    pub queue: VecDeque<NodeId>,
    pub last_granted: BTreeMap<NodeId, u64>,
    /// Number of hand-offs so far.
    pub transfer: u64,
}

impl Token {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            queue: VecDeque::new(),
            last_granted: BTreeMap::new(),
            transfer: 0,
        }
    }

    fn ln(&self, node: NodeId) -> u64 {
        self.last_granted.get(&node).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default, Clone)]
struct ResourceState {
    rn: BTreeMap<NodeId, u64>,
    withdrawn: BTreeMap<NodeId, u64>,
    token: Option<Token>,
    holding: bool,
    wanting: bool,
    /// Highest transfer number received or issued here.
    last_transfer: Option<u64>,
}

impl ResourceState {
    fn rn(&self, node: NodeId) -> u64 {
        self.rn.get(&node).copied().unwrap_or(0)
    }

    fn withdrawn(&self, node: NodeId) -> u64 {
        self.withdrawn.get(&node).copied().unwrap_or(0)
    }
}

/// Result of a local request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub sequence: u64,
    pub granted: bool,
    pub outbound: Vec<Outbound>,
}

/// Result of a token arriving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenDelivery {
    /// The token was wanted here; the resource is now held.
    Granted,
    /// Passed on (or kept idle) because nobody here wants it.
    Forwarded(Vec<Outbound>),
    /// Duplicate or stale delivery.
    Dropped,
}

#[derive(Debug)]
pub struct SuzukiKasami {
    id: NodeId,
    minter: Option<NodeId>,
    resources: HashMap<String, ResourceState>,
}

impl SuzukiKasami {
    /// `minter` is the node that creates each token on first use: the lowest
    /// seed member.
    pub fn new(id: NodeId, minter: Option<NodeId>) -> Self {
        Self {
            id,
            minter,
            resources: HashMap::new(),
        }
    }

    fn state(&mut self, resource: &str) -> &mut ResourceState {
        let minter = self.minter == Some(self.id);
        self.resources
            .entry(resource.to_string())
            .or_insert_with(|| {
                let mut state = ResourceState::default();
                if minter {
                    info!(resource, "Minting token");
                    state.token = Some(Token::new(resource));
                    state.last_transfer = Some(0);
                }
                state
            })
    }

    /// Request the token. `peers` is the Active membership without this node.
    pub fn request(&mut self, resource: &str, timestamp: VectorClock, peers: &[NodeId]) -> Result<TokenRequest> {
        let id = self.id;
        let state = self.state(resource);
        if state.holding || state.wanting {
            return Err(CoordError::ResourceBusy {
                resource: resource.to_string(),
            });
        }

        let sequence = state.rn(id) + 1;
        state.rn.insert(id, sequence);

        if state.token.is_some() {
            // idle token held locally
            state.holding = true;
            return Ok(TokenRequest {
                sequence,
                granted: true,
                outbound: Vec::new(),
            });
        }

        state.wanting = true;
        let outbound = Outbound::broadcast(
            peers.iter().copied().filter(|p| *p != id),
            Message::ResourceRequest {
                resource: resource.to_string(),
                timestamp,
                sequence,
            },
        );
        Ok(TokenRequest {
            sequence,
            granted: false,
            outbound,
        })
    }

    pub fn handle_request(&mut self, from: NodeId, resource: &str, sequence: u64) -> Vec<Outbound> {
        let state = self.state(resource);
        if sequence <= state.rn(from) {
            debug!(from = %from, resource, sequence, "Duplicate token request");
            return Vec::new();
        }
        state.rn.insert(from, sequence);

        let Some(token) = state.token.as_ref() else {
            return Vec::new();
        };
        if state.holding || sequence != token.ln(from) + 1 {
            return Vec::new();
        }
        if state.withdrawn(from) >= sequence {
            return Vec::new();
        }

        let mut token = match state.token.take() {
            Some(t) => t,
            None => return Vec::new(),
        };
        token.queue.retain(|n| *n != from);
        token.transfer += 1;
        state.last_transfer = Some(token.transfer);
        vec![Outbound::new(from, Message::TokenTransfer { token })]
    }

    /// Accept a transferred token.
    pub fn handle_token(&mut self, token: Token, is_active: impl Fn(NodeId) -> bool) -> TokenDelivery {
        let resource = token.resource.clone();
        let id = self.id;
        let state = self.state(&resource);
        if state.last_transfer.is_some_and(|t| token.transfer <= t) || state.token.is_some() {
            debug!(resource = %resource, transfer = token.transfer, "Dropping duplicate token");
            return TokenDelivery::Dropped;
        }
        state.last_transfer = Some(token.transfer);

        if state.wanting {
            state.wanting = false;
            state.holding = true;
            state.token = Some(token);
            return TokenDelivery::Granted;
        }

        debug!(node = %id, resource = %resource, "Token arrived unwanted, forwarding");
        state.token = Some(token);
        TokenDelivery::Forwarded(Self::pass_on(id, state, &is_active))
    }

    /// Leave the critical section and pass the token to the next requester.
    pub fn release(&mut self, resource: &str, is_active: impl Fn(NodeId) -> bool) -> Vec<Outbound> {
        let id = self.id;
        let state = self.state(resource);
        if !state.holding {
            return Vec::new();
        }
        state.holding = false;
        let served = state.rn(id);
        if let Some(token) = state.token.as_mut() {
            token.last_granted.insert(id, served);
        }
        Self::pass_on(id, state, &is_active)
    }

    /// Withdraw a pending request.
    pub fn withdraw(&mut self, resource: &str, peers: &[NodeId], is_active: impl Fn(NodeId) -> bool) -> Vec<Outbound> {
        let id = self.id;
        let state = self.state(resource);
        if state.holding {
            return self.release(resource, is_active);
        }
        if !state.wanting {
            return Vec::new();
        }
        state.wanting = false;
        let sequence = state.rn(id);
        state.withdrawn.insert(id, sequence);
        Outbound::broadcast(
            peers.iter().copied().filter(|p| *p != id),
            Message::ResourceRelease {
                resource: resource.to_string(),
                sequence,
            },
        )
    }

    /// A peer withdrew its request numbered `sequence`.
    pub fn handle_release(&mut self, from: NodeId, resource: &str, sequence: u64) {
        let state = self.state(resource);
        let entry = state.withdrawn.entry(from).or_insert(0);
        *entry = (*entry).max(sequence);
        if state.rn(from) < sequence {
            state.rn.insert(from, sequence);
        }
        if let Some(token) = state.token.as_mut() {
            if token.ln(from) < sequence {
                token.queue.retain(|n| *n != from);
                token.last_granted.insert(from, sequence);
            }
        }
    }

    /// Drop a departed node from any idle token's queue.
    pub fn peer_departed(&mut self, node: NodeId) {
        for state in self.resources.values_mut() {
            if let Some(token) = state.token.as_mut() {
                token.queue.retain(|n| *n != node);
            }
        }
    }

    fn reconcile(id: NodeId, state: &mut ResourceState) {
        let rn = state.rn.clone();
        let withdrawn = state.withdrawn.clone();
        let Some(token) = state.token.as_mut() else {
            return;
        };
        for (node, requested) in rn {
            let w = withdrawn.get(&node).copied().unwrap_or(0);
            if w >= requested && token.ln(node) < requested {
                token.last_granted.insert(node, requested);
                token.queue.retain(|n| *n != node);
                continue;
            }
            if node == id {
                continue;
            }
            if requested == token.ln(node) + 1 && !token.queue.contains(&node) {
                token.queue.push_back(node);
            }
        }
    }

    fn pass_on(id: NodeId, state: &mut ResourceState, is_active: &impl Fn(NodeId) -> bool) -> Vec<Outbound> {
        Self::reconcile(id, state);
        let Some(token) = state.token.as_mut() else {
            return Vec::new();
        };
        let mut skipped = Vec::new();
        let mut next = None;
        while let Some(candidate) = token.queue.pop_front() {
            if is_active(candidate) {
                next = Some(candidate);
                break;
            }
            skipped.push(candidate);
        }
        if !skipped.is_empty() {
            debug!(skipped = ?skipped, "Skipping inactive requesters");
        }
        let Some(to) = next else {
            return Vec::new();
        };
        let Some(mut token) = state.token.take() else {
            return Vec::new();
        };
        token.transfer += 1;
        state.last_transfer = Some(token.transfer);
        vec![Outbound::new(to, Message::TokenTransfer { token })]
    }

    pub fn holds(&self, resource: &str) -> bool {
        self.resources.get(resource).is_some_and(|s| s.holding)
    }

    pub fn is_pending(&self, resource: &str) -> bool {
        self.resources.get(resource).is_some_and(|s| s.wanting)
    }

    pub fn has_token(&self, resource: &str) -> bool {
        self.resources.get(resource).is_some_and(|s| s.token.is_some())
    }

    pub fn held_resources(&self) -> BTreeSet<String> {
        self.resources
            .iter()
            .filter(|(_, s)| s.holding)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Tokens currently at this node.
    pub fn tokens(&self) -> BTreeMap<String, Token> {
        self.resources
            .iter()
            .filter_map(|(n, s)| s.token.clone().map(|t| (n.clone(), t)))
            .collect()
    }

    /// Reset to a checkpoint: `tokens` are here and `held` (a subset of
    /// their resources) are in use.
    ///
    /// A checkpointed token older than a transfer this node has since seen is
    /// not brought back; it lives elsewhere now. Returns the refused
    /// resources.
    pub fn restore(&mut self, tokens: &BTreeMap<String, Token>, held: &BTreeSet<String>) -> Vec<String> {
        for state in self.resources.values_mut() {
            state.token = None;
            state.holding = false;
            state.wanting = false;
        }
        let mut refused = Vec::new();
        for (name, token) in tokens {
            let state = self.resources.entry(name.clone()).or_default();
            if let Some(seen) = state.last_transfer.filter(|seen| *seen > token.transfer) {
                warn!(resource = %name, checkpointed = token.transfer, seen, "Not restoring token that has moved on");
                refused.push(name.clone());
                continue;
            }
            state.last_transfer = Some(token.transfer);
            state.token = Some(token.clone());
            state.holding = held.contains(name);
        }
        refused
    }
}
