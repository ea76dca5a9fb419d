//! Centralized protocol and configuration constants.
//!
//! Defaults mirror the cluster settings the administrative application
//! historically shipped with (5 s election timeout, 1 s heartbeat, f = 1,
//! 10 s agreement budget, 5-minute checkpoints retained 24 deep).

// =============================================================================
// Election & Heartbeat
// =============================================================================

/// Default base election timeout in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 5_000;

/// Default leader heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Default fraction of the election timeout added as random jitter.
///
/// A value of 1.0 draws timeouts uniformly from `[T, 2T]`.
pub const DEFAULT_ELECTION_JITTER_FACTOR: f64 = 1.0;

/// Consecutive heartbeat rounds without majority acknowledgement before a
/// leader steps down.
pub const DEFAULT_LEADER_ACK_ROUNDS: u32 = 3;

// =============================================================================
// Failure Detection
// =============================================================================

/// Consecutive missed heartbeat intervals before a peer is Suspected.
pub const DEFAULT_SUSPICION_THRESHOLD: u32 = 3;

/// Grace period after a peer is first tracked before misses count, in ms.
pub const DEFAULT_STARTUP_GRACE_MS: u64 = 2_000;

// =============================================================================
// Byzantine Agreement
// =============================================================================

/// Default number of tolerated Byzantine participants.
pub const DEFAULT_FAULT_TOLERANCE: usize = 1;

/// Default total budget for one agreement, in milliseconds.
pub const DEFAULT_AGREEMENT_TIMEOUT_MS: u64 = 10_000;

/// Finalized verdicts kept for inspection.
pub const VERDICT_HISTORY_LIMIT: usize = 256;

// =============================================================================
// Checkpoints
// =============================================================================

/// Default periodic checkpoint interval in seconds.
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 300;

/// Default number of committed checkpoints retained.
pub const DEFAULT_CHECKPOINT_RETENTION: usize = 24;

/// Default time a checkpoint may spend replicating, in milliseconds.
pub const DEFAULT_REPLICATION_TIMEOUT_MS: u64 = 5_000;

// =============================================================================
// Membership & History
// =============================================================================

/// Membership transitions retained in the change log.
pub const MEMBERSHIP_CHANGE_LOG_LIMIT: usize = 1_024;

/// Default number of causally stamped events retained.
pub const DEFAULT_CAUSAL_HISTORY_LIMIT: usize = 10_000;

// =============================================================================
// Wire Protocol
// =============================================================================

/// Frame header: 4-byte big-endian payload length + 4-byte CRC-32C.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on an encoded message payload (16 MiB).
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

// =============================================================================
// Engine Plumbing
// =============================================================================

/// Capacity of the engine's command channel.
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the engine's inbound message channel.
pub const INBOX_CHANNEL_CAPACITY: usize = 4_096;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Object store prefix under which engine state is persisted.
pub const STATE_PREFIX: &str = "meshcoord";
