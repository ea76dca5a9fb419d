//! Heartbeat-based failure detection for cluster peers.
//!
//! Every inbound envelope counts as contact from its sender. A periodic check
//! compares the time since last contact against the heartbeat interval:
//!
//! 1. **Healthy** - contact within `suspicion_threshold` intervals
//! 2. **Suspected** - `suspicion_threshold` consecutive intervals missed
//! 3. **Failed** - `auto_fail_threshold` intervals missed (only when enabled)
//!
//! The detector only reports transitions; the engine applies them to the
//! membership store. Suspected is the default terminal state because it keeps
//! a transiently partitioned peer in the member set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_STARTUP_GRACE_MS, DEFAULT_SUSPICION_THRESHOLD,
};
use crate::types::NodeId;

/// Configuration for the failure detector.
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// Expected contact interval.
    pub heartbeat_interval: Duration,

    /// Consecutive missed intervals before a peer is Suspected.
    pub suspicion_threshold: u32,

    /// Consecutive missed intervals before a peer is Failed. `None` keeps
    /// silent peers Suspected until an operator or verdict fails them.
    pub auto_fail_threshold: Option<u32>,

    /// Contact arriving within this tolerance of the deadline is not a miss.
    pub jitter_tolerance: Duration,

    /// Time after a peer is first tracked before misses are counted.
    pub startup_grace_period: Duration,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            suspicion_threshold: DEFAULT_SUSPICION_THRESHOLD,
            auto_fail_threshold: None,
            jitter_tolerance: Duration::from_millis(50),
            startup_grace_period: Duration::from_millis(DEFAULT_STARTUP_GRACE_MS),
        }
    }
}

impl FailureDetectorConfig {
    /// Time without contact before a peer is suspected.
    pub fn suspicion_time(&self) -> Duration {
        self.heartbeat_interval * self.suspicion_threshold
    }
}

/// Health of a peer from the detector's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealth {
    Healthy,
    Suspected,
    Failed,
}

impl std::fmt::Display for PeerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerHealth::Healthy => write!(f, "healthy"),
            PeerHealth::Suspected => write!(f, "suspected"),
            PeerHealth::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug)]
struct PeerState {
    last_contact: Instant,
    missed: u32,
    health: PeerHealth,
    tracked_since: Instant,
}

impl PeerState {
    fn new(now: Instant) -> Self {
        Self {
            last_contact: now,
            missed: 0,
            health: PeerHealth::Healthy,
            tracked_since: now,
        }
    }
}

/// A health transition reported by [`FailureDetector::check_at`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthChange {
    pub node: NodeId,
    pub previous: PeerHealth,
    pub current: PeerHealth,
    pub missed_heartbeats: u32,
    pub since_last_contact: Duration,
}

/// Tracks last contact per peer.
pub struct FailureDetector {
    config: FailureDetectorConfig,
    peers: DashMap<NodeId, PeerState>,
    suspicions: AtomicU64,
    recoveries: AtomicU64,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        debug!(
            heartbeat_interval_ms = config.heartbeat_interval.as_millis() as u64,
            suspicion_threshold = config.suspicion_threshold,
            auto_fail_threshold = ?config.auto_fail_threshold,
            "Creating failure detector"
        );
        Self {
            config,
            peers: DashMap::new(),
            suspicions: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &FailureDetectorConfig {
        &self.config
    }

    /// Start tracking a peer. Re-tracking resets its state.
    pub fn track(&self, node: NodeId) {
        self.peers.insert(node, PeerState::new(Instant::now()));
    }

    pub fn untrack(&self, node: NodeId) {
        self.peers.remove(&node);
    }

    pub fn is_tracked(&self, node: NodeId) -> bool {
        self.peers.contains_key(&node)
    }

    /// Record contact from a peer.
    ///
    /// Returns true if the peer was previously Suspected or Failed, i.e. its
    /// contact has resumed.
    pub fn record_contact(&self, node: NodeId) -> bool {
        let now = Instant::now();
        let mut recovered = false;
        self.peers
            .entry(node)
            .and_modify(|peer| {
                recovered = peer.health != PeerHealth::Healthy;
                peer.last_contact = now;
                peer.missed = 0;
                peer.health = PeerHealth::Healthy;
            })
            .or_insert_with(|| PeerState::new(now));
        if recovered {
            debug!(node = %node, "Peer contact resumed");
            self.recoveries.fetch_add(1, Ordering::Relaxed);
        }
        recovered
    }

    /// Evaluate every tracked peer against `now`.
    pub fn check_at(&self, now: Instant) -> Vec<HealthChange> {
        let mut changes = Vec::new();
        let interval = self.config.heartbeat_interval.as_nanos();

        for mut entry in self.peers.iter_mut() {
            let node = *entry.key();
            let peer = entry.value_mut();

            if now.saturating_duration_since(peer.tracked_since) < self.config.startup_grace_period {
                continue;
            }

            let elapsed = now.saturating_duration_since(peer.last_contact);
            let effective = elapsed.saturating_sub(self.config.jitter_tolerance);
            let missed = if interval > 0 {
                (effective.as_nanos() / interval) as u32
            } else {
                0
            };
            peer.missed = missed;

            let failed = self
                .config
                .auto_fail_threshold
                .is_some_and(|threshold| missed >= threshold);
            let next = if failed {
                PeerHealth::Failed
            } else if missed >= self.config.suspicion_threshold {
                PeerHealth::Suspected
            } else {
                PeerHealth::Healthy
            };

            // health only degrades here; recovery comes from record_contact
            if next == peer.health || next == PeerHealth::Healthy {
                continue;
            }
            if peer.health == PeerHealth::Failed {
                continue;
            }

            let previous = peer.health;
            peer.health = next;
            match next {
                PeerHealth::Failed => warn!(
                    node = %node,
                    missed_heartbeats = missed,
                    since_last_contact_ms = elapsed.as_millis() as u64,
                    "Peer declared failed"
                ),
                _ => {
                    info!(
                        node = %node,
                        missed_heartbeats = missed,
                        since_last_contact_ms = elapsed.as_millis() as u64,
                        "Peer suspected"
                    );
                    self.suspicions.fetch_add(1, Ordering::Relaxed);
                }
            }
            changes.push(HealthChange {
                node,
                previous,
                current: next,
                missed_heartbeats: missed,
                since_last_contact: elapsed,
            });
        }

        changes.sort_by_key(|c| c.node);
        changes
    }

    pub fn check(&self) -> Vec<HealthChange> {
        self.check_at(Instant::now())
    }

    pub fn health_of(&self, node: NodeId) -> Option<PeerHealth> {
        self.peers.get(&node).map(|p| p.health)
    }

    pub fn time_since_contact(&self, node: NodeId) -> Option<Duration> {
        self.peers
            .get(&node)
            .map(|p| Instant::now().saturating_duration_since(p.last_contact))
    }

    pub fn tracked_count(&self) -> usize {
        self.peers.len()
    }

    pub fn total_suspicions(&self) -> u64 {
        self.suspicions.load(Ordering::Relaxed)
    }

    pub fn total_recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }
}
