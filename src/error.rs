//! Error types for the coordination engine.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used depending on where an error surfaces:
//!
//! ## Fail-Fast (Return to the Caller)
//!
//! Errors that make a single operation impossible are returned through the
//! [`EngineHandle`](crate::cluster::EngineHandle) and never retried inside the
//! engine:
//! - [`CoordError::QuorumUnavailable`]: too few Active members
//! - [`CoordError::ReplicationTimeout`]: a chain replica did not acknowledge
//! - [`CoordError::AgreementInconclusive`]: Byzantine threshold not met
//!
//! ## Log and Drop (Inbound Messages)
//!
//! Errors caused by a single inbound message (stale term, malformed frame,
//! sequence mismatch) are logged and the message is discarded. They never stop
//! the engine loop.
//!
//! The only retries the engine performs on its own are the jittered election
//! and heartbeat paths.

use thiserror::Error;

use crate::cluster::membership::MemberStatus;
use crate::types::{CheckpointSeq, NodeId, Term};

/// Result type for coordination operations.
pub type Result<T> = std::result::Result<T, CoordError>;

/// Errors produced by the coordination engine.
#[derive(Debug, Error)]
pub enum CoordError {
    /// A message referenced an election term older than the local one.
    #[error("stale term {received} (current term {current})")]
    StaleTerm { received: Term, current: Term },

    /// Fewer Active members than the operation requires.
    #[error("quorum unavailable: {available} active members, {required} required")]
    QuorumUnavailable { required: usize, available: usize },

    /// The resource is already requested or held by this node.
    #[error("resource '{resource}' is busy on this node")]
    ResourceBusy { resource: String },

    /// A replica in the checkpoint chain failed to acknowledge in time.
    #[error("checkpoint {sequence} replication timed out waiting for {replica}")]
    ReplicationTimeout {
        sequence: CheckpointSeq,
        replica: NodeId,
    },

    /// Too few participants for the Byzantine agreement to be safe.
    #[error(
        "agreement on {subject} inconclusive: {participants} participants, {required} required"
    )]
    AgreementInconclusive {
        subject: NodeId,
        participants: usize,
        required: usize,
    },

    /// The node is not part of the membership.
    #[error("{0} is not a cluster member")]
    UnknownMember(NodeId),

    /// The requested membership status change is not allowed.
    #[error("invalid membership transition for {node}: {from} -> {to}")]
    InvalidTransition {
        node: NodeId,
        from: MemberStatus,
        to: MemberStatus,
    },

    /// No committed checkpoint at or below the requested sequence.
    #[error("no checkpoint at or below {0}")]
    CheckpointNotFound(CheckpointSeq),

    /// A checkpoint is still replicating; the next one must wait.
    #[error("checkpoint {0} is still replicating")]
    CheckpointInProgress(CheckpointSeq),

    /// A restore is still waiting on replicas for an earlier request.
    #[error("restore of checkpoint {0} is still in progress")]
    RestoreInProgress(CheckpointSeq),

    /// The caller withdrew a pending resource request.
    #[error("request for resource '{resource}' was withdrawn")]
    Cancelled { resource: String },

    /// The operation did not complete within its time budget.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A message could not be interpreted.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Binary encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Durable storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport could not deliver a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// The engine has stopped.
    #[error("engine is shut down")]
    Shutdown,
}

impl CoordError {
    /// Returns true if the caller may retry the same operation later.
    ///
    /// Quorum and replication failures resolve once membership changes;
    /// inconclusive agreements may succeed after more members join.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoordError::QuorumUnavailable { .. }
                | CoordError::ResourceBusy { .. }
                | CoordError::ReplicationTimeout { .. }
                | CoordError::AgreementInconclusive { .. }
                | CoordError::CheckpointInProgress(_)
                | CoordError::RestoreInProgress(_)
                | CoordError::Timeout(_)
                | CoordError::Transport(_)
        )
    }

    /// Returns true for errors caused by a single inbound message.
    ///
    /// These are logged and the message dropped; the engine keeps running.
    pub fn is_message_local(&self) -> bool {
        matches!(
            self,
            CoordError::StaleTerm { .. } | CoordError::Malformed(_) | CoordError::Codec(_)
        )
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            CoordError::StaleTerm { .. } => "stale_term",
            CoordError::QuorumUnavailable { .. } => "quorum_unavailable",
            CoordError::ResourceBusy { .. } => "resource_busy",
            CoordError::ReplicationTimeout { .. } => "replication_timeout",
            CoordError::AgreementInconclusive { .. } => "agreement_inconclusive",
            CoordError::UnknownMember(_) => "unknown_member",
            CoordError::InvalidTransition { .. } => "invalid_transition",
            CoordError::CheckpointNotFound(_) => "checkpoint_not_found",
            CoordError::CheckpointInProgress(_) => "checkpoint_in_progress",
            CoordError::RestoreInProgress(_) => "restore_in_progress",
            CoordError::Cancelled { .. } => "cancelled",
            CoordError::Timeout(_) => "timeout",
            CoordError::Malformed(_) => "malformed",
            CoordError::Codec(_) => "codec",
            CoordError::Storage(_) => "storage",
            CoordError::Config(_) => "config",
            CoordError::Transport(_) => "transport",
            CoordError::Shutdown => "shutdown",
        }
    }
}
