//! Engine configuration.
//!
//! # Configuration Profiles
//!
//! ```rust
//! use meshcoord::cluster::{ClusterProfile, EngineConfig};
//! use meshcoord::types::NodeId;
//!
//! // Relaxed timeouts for local debugging
//! let dev = EngineConfig::from_profile(NodeId(1), ClusterProfile::Development);
//!
//! // Fast failover on a low-latency network
//! let fast = EngineConfig::from_profile(NodeId(1), ClusterProfile::LowLatency)
//!     .with_seed_members([NodeId(1), NodeId(2), NodeId(3)]);
//! assert!(fast.validate().is_ok());
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::failure_detector::FailureDetectorConfig;
use crate::constants::{
    DEFAULT_AGREEMENT_TIMEOUT_MS, DEFAULT_CAUSAL_HISTORY_LIMIT, DEFAULT_CHECKPOINT_INTERVAL_SECS,
    DEFAULT_CHECKPOINT_RETENTION, DEFAULT_ELECTION_JITTER_FACTOR, DEFAULT_ELECTION_TIMEOUT_MS,
    DEFAULT_FAULT_TOLERANCE, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_LEADER_ACK_ROUNDS,
    DEFAULT_REPLICATION_TIMEOUT_MS, DEFAULT_STARTUP_GRACE_MS, DEFAULT_SUSPICION_THRESHOLD,
};
use crate::error::{CoordError, Result};
use crate::types::NodeId;

/// Timing presets.
///
/// | Profile | Election | Heartbeat | Agreement | Use Case |
/// |---------|----------|-----------|-----------|----------|
/// | Development | 1.5 s | 300 ms | 3 s | Local testing |
/// | Production | 5 s | 1 s | 10 s | Device fleets on Wi-Fi |
/// | LowLatency | 500 ms | 100 ms | 2 s | Wired, same-rack nodes |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterProfile {
    Development,
    Production,
    LowLatency,
}

impl ClusterProfile {
    pub fn description(&self) -> &'static str {
        match self {
            ClusterProfile::Development => "Local development and testing",
            ClusterProfile::Production => "Device fleets on lossy networks",
            ClusterProfile::LowLatency => "Fast failover on wired networks",
        }
    }

    pub fn all() -> &'static [ClusterProfile] {
        &[
            ClusterProfile::Development,
            ClusterProfile::Production,
            ClusterProfile::LowLatency,
        ]
    }
}

impl std::fmt::Display for ClusterProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterProfile::Development => write!(f, "development"),
            ClusterProfile::Production => write!(f, "production"),
            ClusterProfile::LowLatency => write!(f, "low-latency"),
        }
    }
}

impl std::str::FromStr for ClusterProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(ClusterProfile::Development),
            "production" | "prod" => Ok(ClusterProfile::Production),
            "low-latency" | "latency" | "ll" => Ok(ClusterProfile::LowLatency),
            _ => Err(format!(
                "Unknown profile '{}'. Valid profiles: development, production, low-latency",
                s
            )),
        }
    }
}

/// Which mutual-exclusion algorithm guards a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceProtocol {
    /// Permission based: every Active peer must reply.
    #[default]
    RicartAgrawala,
    /// Token based: whoever holds the token may enter.
    SuzukiKasami,
}

impl ResourceProtocol {
    /// Label used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceProtocol::RicartAgrawala => "ricart_agrawala",
            ResourceProtocol::SuzukiKasami => "suzuki_kasami",
        }
    }
}

impl std::fmt::Display for ResourceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceProtocol::RicartAgrawala => write!(f, "ricart-agrawala"),
            ResourceProtocol::SuzukiKasami => write!(f, "suzuki-kasami"),
        }
    }
}

impl std::str::FromStr for ResourceProtocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ricart-agrawala" | "ricart_agrawala" | "ra" | "permission" => {
                Ok(ResourceProtocol::RicartAgrawala)
            }
            "suzuki-kasami" | "suzuki_kasami" | "sk" | "token" => Ok(ResourceProtocol::SuzukiKasami),
            _ => Err(format!(
                "Unknown resource protocol '{}'. Valid protocols: ricart-agrawala, suzuki-kasami",
                s
            )),
        }
    }
}

/// Configuration of one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub node_id: NodeId,

    /// Initial membership, all Active at version 1.
    ///
    /// The lowest seed also mints every Suzuki–Kasami token.
    pub seed_members: Vec<NodeId>,

    /// Base election timeout.
    pub election_timeout: Duration,

    /// Fraction of `election_timeout` added as random jitter.
    pub election_jitter_factor: f64,

    pub heartbeat_interval: Duration,

    /// Rounds without majority acknowledgement before a leader steps down.
    pub leader_ack_rounds: u32,

    /// Missed heartbeat intervals before a peer is Suspected.
    pub suspicion_threshold: u32,

    /// Missed heartbeat intervals before a peer is Failed. `None` leaves silent
    /// peers Suspected.
    pub auto_fail_threshold: Option<u32>,

    pub startup_grace_period: Duration,

    /// Byzantine participants tolerated (`f`).
    pub fault_tolerance: usize,

    /// Total budget of one agreement, split evenly across its `f + 1` rounds.
    pub agreement_timeout: Duration,

    /// Ordered checkpoint replicas, head first.
    pub replica_chain: Vec<NodeId>,

    pub replication_timeout: Duration,

    /// Period of automatic checkpoints. `None` disables them.
    pub checkpoint_interval: Option<Duration>,

    pub checkpoint_retention: usize,

    pub causal_history_limit: usize,

    pub default_protocol: ResourceProtocol,

    /// Per-resource overrides of `default_protocol`.
    pub resource_bindings: BTreeMap<String, ResourceProtocol>,

    /// Directory for durable state. `None` keeps state in memory.
    pub data_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(0),
            seed_members: Vec::new(),
            election_timeout: Duration::from_millis(DEFAULT_ELECTION_TIMEOUT_MS),
            election_jitter_factor: DEFAULT_ELECTION_JITTER_FACTOR,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            leader_ack_rounds: DEFAULT_LEADER_ACK_ROUNDS,
            suspicion_threshold: DEFAULT_SUSPICION_THRESHOLD,
            auto_fail_threshold: None,
            startup_grace_period: Duration::from_millis(DEFAULT_STARTUP_GRACE_MS),
            fault_tolerance: DEFAULT_FAULT_TOLERANCE,
            agreement_timeout: Duration::from_millis(DEFAULT_AGREEMENT_TIMEOUT_MS),
            replica_chain: Vec::new(),
            replication_timeout: Duration::from_millis(DEFAULT_REPLICATION_TIMEOUT_MS),
            checkpoint_interval: Some(Duration::from_secs(DEFAULT_CHECKPOINT_INTERVAL_SECS)),
            checkpoint_retention: DEFAULT_CHECKPOINT_RETENTION,
            causal_history_limit: DEFAULT_CAUSAL_HISTORY_LIMIT,
            default_protocol: ResourceProtocol::RicartAgrawala,
            resource_bindings: BTreeMap::new(),
            data_path: None,
        }
    }
}

impl EngineConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn from_profile(node_id: NodeId, profile: ClusterProfile) -> Self {
        let base = Self::new(node_id);
        match profile {
            ClusterProfile::Production => base,
            ClusterProfile::Development => Self {
                election_timeout: Duration::from_millis(1_500),
                heartbeat_interval: Duration::from_millis(300),
                startup_grace_period: Duration::from_millis(500),
                agreement_timeout: Duration::from_secs(3),
                replication_timeout: Duration::from_secs(2),
                checkpoint_interval: Some(Duration::from_secs(60)),
                ..base
            },
            ClusterProfile::LowLatency => Self {
                election_timeout: Duration::from_millis(500),
                heartbeat_interval: Duration::from_millis(100),
                startup_grace_period: Duration::from_millis(300),
                agreement_timeout: Duration::from_secs(2),
                replication_timeout: Duration::from_secs(1),
                ..base
            },
        }
    }

    pub fn with_seed_members(mut self, seeds: impl IntoIterator<Item = NodeId>) -> Self {
        self.seed_members = seeds.into_iter().collect();
        self
    }

    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn with_election_jitter_factor(mut self, factor: f64) -> Self {
        self.election_jitter_factor = factor;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_leader_ack_rounds(mut self, rounds: u32) -> Self {
        self.leader_ack_rounds = rounds;
        self
    }

    pub fn with_suspicion_threshold(mut self, threshold: u32) -> Self {
        self.suspicion_threshold = threshold;
        self
    }

    pub fn with_auto_fail_threshold(mut self, threshold: Option<u32>) -> Self {
        self.auto_fail_threshold = threshold;
        self
    }

    pub fn with_startup_grace_period(mut self, grace: Duration) -> Self {
        self.startup_grace_period = grace;
        self
    }

    pub fn with_fault_tolerance(mut self, f: usize) -> Self {
        self.fault_tolerance = f;
        self
    }

    pub fn with_agreement_timeout(mut self, timeout: Duration) -> Self {
        self.agreement_timeout = timeout;
        self
    }

    pub fn with_replica_chain(mut self, chain: impl IntoIterator<Item = NodeId>) -> Self {
        self.replica_chain = chain.into_iter().collect();
        self
    }

    pub fn with_replication_timeout(mut self, timeout: Duration) -> Self {
        self.replication_timeout = timeout;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Option<Duration>) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_checkpoint_retention(mut self, retention: usize) -> Self {
        self.checkpoint_retention = retention;
        self
    }

    pub fn with_default_protocol(mut self, protocol: ResourceProtocol) -> Self {
        self.default_protocol = protocol;
        self
    }

    pub fn with_resource_binding(mut self, resource: impl Into<String>, protocol: ResourceProtocol) -> Self {
        self.resource_bindings.insert(resource.into(), protocol);
        self
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    pub fn protocol_for(&self, resource: &str) -> ResourceProtocol {
        self.resource_bindings
            .get(resource)
            .copied()
            .unwrap_or(self.default_protocol)
    }

    /// Timeout of a single agreement round.
    pub fn round_timeout(&self) -> Duration {
        self.agreement_timeout / (self.fault_tolerance as u32 + 1)
    }

    /// The node that mints Suzuki–Kasami tokens.
    pub fn token_minter(&self) -> Option<NodeId> {
        self.seed_members.iter().min().copied()
    }

    pub fn failure_detector_config(&self) -> FailureDetectorConfig {
        FailureDetectorConfig {
            heartbeat_interval: self.heartbeat_interval,
            suspicion_threshold: self.suspicion_threshold,
            auto_fail_threshold: self.auto_fail_threshold,
            startup_grace_period: self.startup_grace_period,
            ..Default::default()
        }
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.heartbeat_interval.is_zero() {
            errors.push("heartbeat_interval must be greater than zero".to_string());
        }

        // followers must hear several heartbeats before their election timer fires
        if self.heartbeat_interval >= self.election_timeout {
            errors.push(format!(
                "heartbeat_interval ({:?}) must be less than election_timeout ({:?})",
                self.heartbeat_interval, self.election_timeout
            ));
        }

        if !(0.0..=4.0).contains(&self.election_jitter_factor) {
            errors.push(format!(
                "election_jitter_factor ({}) must be between 0.0 and 4.0",
                self.election_jitter_factor
            ));
        }

        if self.leader_ack_rounds == 0 {
            errors.push("leader_ack_rounds must be at least 1".to_string());
        }

        if self.suspicion_threshold == 0 {
            errors.push("suspicion_threshold must be at least 1".to_string());
        }

        if let Some(fail) = self.auto_fail_threshold {
            if fail <= self.suspicion_threshold {
                errors.push(format!(
                    "auto_fail_threshold ({}) must exceed suspicion_threshold ({})",
                    fail, self.suspicion_threshold
                ));
            }
        }

        if self.fault_tolerance > 16 {
            errors.push(format!(
                "fault_tolerance ({}) must not exceed 16",
                self.fault_tolerance
            ));
        }

        if self.round_timeout() < Duration::from_millis(10) {
            errors.push(format!(
                "agreement_timeout ({:?}) leaves less than 10ms per round",
                self.agreement_timeout
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for replica in &self.replica_chain {
            if !seen.insert(replica) {
                errors.push(format!("replica_chain lists {} more than once", replica));
            }
        }

        if self.replication_timeout.is_zero() {
            errors.push("replication_timeout must be greater than zero".to_string());
        }

        if self.checkpoint_interval.is_some_and(|i| i.is_zero()) {
            errors.push("checkpoint_interval must be greater than zero when set".to_string());
        }

        if self.checkpoint_retention == 0 {
            errors.push("checkpoint_retention must be at least 1".to_string());
        }

        if self.causal_history_limit == 0 {
            errors.push("causal_history_limit must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `NODE_ID` (required): this node's id
    /// - `CLUSTER_PROFILE`: base profile (default `production`)
    /// - `SEED_MEMBERS`: comma-separated node ids
    /// - `ELECTION_TIMEOUT_MS`, `HEARTBEAT_INTERVAL_MS`, `SUSPICION_THRESHOLD`
    /// - `FAULT_TOLERANCE`, `AGREEMENT_TIMEOUT_MS`
    /// - `REPLICA_CHAIN`: comma-separated node ids, head first
    /// - `REPLICATION_TIMEOUT_MS`
    /// - `CHECKPOINT_INTERVAL_SECS`: `0` disables periodic checkpoints
    /// - `CHECKPOINT_RETENTION`
    /// - `DATA_PATH`: directory for durable state
    /// - `RESOURCE_BINDINGS`: `name=protocol` pairs, e.g. `printer=ra,gpu=sk`
    pub fn from_env() -> Result<Self> {
        let node_id: NodeId = std::env::var("NODE_ID")
            .map_err(|_| CoordError::Config("NODE_ID is required".to_string()))?
            .parse()
            .map_err(|e| CoordError::Config(format!("Invalid NODE_ID: {}", e)))?;

        let profile = match std::env::var("CLUSTER_PROFILE") {
            Ok(value) => value.parse().map_err(CoordError::Config)?,
            Err(_) => ClusterProfile::Production,
        };
        let mut config = Self::from_profile(node_id, profile);

        if let Ok(value) = std::env::var("SEED_MEMBERS") {
            config.seed_members = parse_node_list("SEED_MEMBERS", &value)?;
        }
        if let Some(ms) = parse_var::<u64>("ELECTION_TIMEOUT_MS")? {
            config.election_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(threshold) = parse_var("SUSPICION_THRESHOLD")? {
            config.suspicion_threshold = threshold;
        }
        if let Some(f) = parse_var("FAULT_TOLERANCE")? {
            config.fault_tolerance = f;
        }
        if let Some(ms) = parse_var::<u64>("AGREEMENT_TIMEOUT_MS")? {
            config.agreement_timeout = Duration::from_millis(ms);
        }
        if let Ok(value) = std::env::var("REPLICA_CHAIN") {
            config.replica_chain = parse_node_list("REPLICA_CHAIN", &value)?;
        }
        if let Some(ms) = parse_var::<u64>("REPLICATION_TIMEOUT_MS")? {
            config.replication_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>("CHECKPOINT_INTERVAL_SECS")? {
            config.checkpoint_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(retention) = parse_var("CHECKPOINT_RETENTION")? {
            config.checkpoint_retention = retention;
        }
        if let Ok(path) = std::env::var("DATA_PATH") {
            config.data_path = Some(PathBuf::from(path));
        }
        if let Ok(value) = std::env::var("RESOURCE_BINDINGS") {
            config.resource_bindings = parse_bindings(&value)?;
        }

        Ok(config)
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CoordError::Config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

fn parse_node_list(name: &str, value: &str) -> Result<Vec<NodeId>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|e| CoordError::Config(format!("Invalid {}: {}", name, e)))
        })
        .collect()
}

fn parse_bindings(value: &str) -> Result<BTreeMap<String, ResourceProtocol>> {
    let mut bindings = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, protocol) = pair.split_once('=').ok_or_else(|| {
            CoordError::Config(format!("Invalid RESOURCE_BINDINGS entry '{}'", pair))
        })?;
        let protocol = protocol.parse().map_err(CoordError::Config)?;
        bindings.insert(name.trim().to_string(), protocol);
    }
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::new(NodeId(1));
        assert!(config.validate().is_ok());
        assert_eq!(config.election_timeout, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.fault_tolerance, 1);
        assert_eq!(config.checkpoint_retention, 24);
    }

    #[test]
    fn test_all_profiles_validate() {
        for profile in ClusterProfile::all() {
            let config = EngineConfig::from_profile(NodeId(1), *profile);
            assert!(config.validate().is_ok(), "{} should validate", profile);
        }
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!("dev".parse::<ClusterProfile>(), Ok(ClusterProfile::Development));
        assert_eq!("LL".parse::<ClusterProfile>(), Ok(ClusterProfile::LowLatency));
        assert!("turbo".parse::<ClusterProfile>().is_err());
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_election_timeout() {
        let config = EngineConfig::new(NodeId(1))
            .with_heartbeat_interval(Duration::from_secs(5))
            .with_election_timeout(Duration::from_secs(5));
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("heartbeat_interval")));
    }

    #[test]
    fn test_duplicate_replica_rejected() {
        let config = EngineConfig::new(NodeId(1)).with_replica_chain([NodeId(2), NodeId(2)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_protocol_binding() {
        let config = EngineConfig::new(NodeId(1))
            .with_resource_binding("gpu", ResourceProtocol::SuzukiKasami);
        assert_eq!(config.protocol_for("gpu"), ResourceProtocol::SuzukiKasami);
        assert_eq!(config.protocol_for("printer"), ResourceProtocol::RicartAgrawala);
    }

    #[test]
    fn test_round_timeout_splits_budget() {
        let config = EngineConfig::new(NodeId(1))
            .with_fault_tolerance(1)
            .with_agreement_timeout(Duration::from_secs(10));
        assert_eq!(config.round_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_token_minter_is_lowest_seed() {
        let config = EngineConfig::new(NodeId(5)).with_seed_members([NodeId(7), NodeId(3), NodeId(5)]);
        assert_eq!(config.token_minter(), Some(NodeId(3)));
    }

    #[test]
    fn test_parse_bindings() {
        let bindings = parse_bindings("printer=ra, gpu = token").unwrap();
        assert_eq!(bindings["printer"], ResourceProtocol::RicartAgrawala);
        assert_eq!(bindings["gpu"], ResourceProtocol::SuzukiKasami);
        assert!(parse_bindings("printer").is_err());
    }
}
