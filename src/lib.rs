//! # meshcoord
//! Coordination and fault tolerance for a cluster of cooperating nodes.
//!
//! One engine runs per node and provides:
//! - group membership with liveness tracking,
//! - leader election with persisted votes,
//! - mutual exclusion for named resources, permission based
//!   (Ricart–Agrawala) or token based (Suzuki–Kasami),
//! - causal ordering with vector clocks,
//! - Byzantine fault detection by oral-messages agreement,
//! - checkpoints replicated down a chain of peers.
//!
//! ## Getting started
//! Build an [`EngineConfig`](cluster::EngineConfig) per node and start it on a
//! [`Transport`](cluster::Transport). For tests and simulations,
//! [`InMemoryNetwork`](cluster::InMemoryNetwork) wires many engines together
//! in one process:
//!
//! ```rust,no_run
//! use meshcoord::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let _ = meshcoord::telemetry::init_logging(meshcoord::telemetry::LogFormat::from_env());
//!     let network = InMemoryNetwork::new();
//!     let config = EngineConfig::from_env()?;
//!     let engine = Engine::connect(config, &network).await?;
//!     let mut events = engine.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", event.describe());
//!     }
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod error;
pub mod protocol;
pub mod types;

pub mod cluster;
pub mod constants;
pub mod telemetry;

pub mod prelude {
    //! The types most callers need.
    pub use crate::cluster::{
        CheckpointInfo, ClusterProfile, ClusterStatistics, Engine, EngineConfig, EngineEvent,
        EngineHandle, InMemoryNetwork, MemberStatus, MembershipSnapshot, ResourceGrant,
        ResourceProtocol, Role, Verdict, VerdictRecord,
    };
    pub use crate::error::{CoordError, Result};
    pub use crate::types::{CheckpointSeq, MembershipVersion, NodeId, Term};
}
