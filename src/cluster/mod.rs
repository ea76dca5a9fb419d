//! Coordination engine for a cluster of cooperating nodes.
//!
//! Every node runs one [`Engine`]. The protocol logic lives in sans-IO cores
//! that take inputs and return outbound messages; the engine actor owns the
//! cores, stamps and sends their messages, drives their timers and persists
//! what must survive a restart.
//!
//! # Architecture
//!
//! ```text
//!   admin layer ──▶ EngineHandle ──▶ Engine actor
//!                                      │
//!          ┌───────────┬───────────────┼──────────────┬───────────────┐
//!          ▼           ▼               ▼              ▼               ▼
//!     membership   election    ricart_agrawala   byzantine      checkpoint
//!   + failure_det.             suzuki_kasami                   + storage
//!          │           │               │              │               │
//!          └───────────┴──────── protocol frames ─────┴───────────────┘
//!                                      │
//!                                  Transport
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use meshcoord::cluster::{Engine, EngineConfig, InMemoryNetwork};
//! use meshcoord::types::NodeId;
//!
//! #[tokio::main]
//! async fn main() -> meshcoord::error::Result<()> {
//!     let network = InMemoryNetwork::new();
//!     let seeds = [NodeId(1), NodeId(2), NodeId(3)];
//!     let mut handles = Vec::new();
//!     for node in seeds {
//!         let config = EngineConfig::new(node).with_seed_members(seeds);
//!         handles.push(Engine::connect(config, &network).await?);
//!     }
//!
//!     let grant = handles[0].request_resource("printer").await?;
//!     println!("granted after {:?}", grant.waited);
//!     handles[0].release_resource("printer").await?;
//!     Ok(())
//! }
//! ```

pub mod background_tasks;
pub mod byzantine;
pub mod checkpoint;
mod config;
pub mod election;
mod engine;
mod events;
pub mod failure_detector;
pub mod membership;
pub mod metrics;
pub mod retry;
pub mod ricart_agrawala;
pub mod storage;
pub mod suzuki_kasami;
pub mod transport;
pub mod vector_clock;

pub use background_tasks::{BackgroundTaskRegistry, TaskStatus};
pub use byzantine::{AgreementId, Observation, Verdict, VerdictRecord};
pub use checkpoint::{Checkpoint, CheckpointInfo};
pub use config::{ClusterProfile, EngineConfig, ResourceProtocol};
pub use election::{ElectionState, Role};
pub use engine::{ClusterStatistics, Engine, EngineHandle, ResourceGrant};
pub use events::EngineEvent;
pub use failure_detector::{FailureDetector, FailureDetectorConfig, PeerHealth};
pub use membership::{MemberStatus, MembershipSnapshot, MembershipStore};
pub use storage::StateStore;
pub use transport::{InMemoryNetwork, Transport};
pub use vector_clock::{CausalEvent, CausalOrdering, LocalClock, VectorClock};
