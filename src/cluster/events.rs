//! Events published by a running engine.

use std::time::Duration;

use crate::cluster::byzantine::{AgreementId, Verdict};
use crate::cluster::config::ResourceProtocol;
use crate::cluster::membership::MemberStatus;
use crate::types::{CheckpointSeq, MembershipVersion, NodeId, Term};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    MembershipChanged {
        version: MembershipVersion,
        node: NodeId,
        from: Option<MemberStatus>,
        to: MemberStatus,
    },
    /// `leader` is `None` when the previous leader was lost without a successor.
    LeaderChanged {
        term: Term,
        leader: Option<NodeId>,
    },
    ResourceGranted {
        resource: String,
        protocol: ResourceProtocol,
        waited: Duration,
    },
    ResourceReleased {
        resource: String,
    },
    SuspicionVerdict {
        agreement: AgreementId,
        verdict: Verdict,
    },
    CheckpointCommitted {
        sequence: CheckpointSeq,
        digest: u32,
    },
}

impl EngineEvent {
    /// One-line description for the causal history.
    pub fn describe(&self) -> String {
        match self {
            EngineEvent::MembershipChanged { node, from, to, .. } => match from {
                Some(from) => format!("{} {} -> {}", node, from, to),
                None => format!("{} added as {}", node, to),
            },
            EngineEvent::LeaderChanged { term, leader } => match leader {
                Some(leader) => format!("{} leads term {}", leader, term),
                None => format!("no leader in term {}", term),
            },
            EngineEvent::ResourceGranted { resource, protocol, .. } => {
                format!("granted '{}' via {}", resource, protocol)
            }
            EngineEvent::ResourceReleased { resource } => format!("released '{}'", resource),
            EngineEvent::SuspicionVerdict { agreement, verdict } => {
                format!("verdict on {}: {}", agreement.subject, verdict)
            }
            EngineEvent::CheckpointCommitted { sequence, .. } => {
                format!("checkpoint {} committed", sequence)
            }
        }
    }
}
