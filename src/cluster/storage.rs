//! Durable engine state in an object store.
//!
//! Layout under `meshcoord/{node}/`:
//!
//! ```text
//! election.bin              PersistedElection
//! membership.bin            MembershipSnapshot
//! checkpoints/manifest.bin  CheckpointManifest
//! checkpoints/{seq}.bin     Checkpoint (committed, own)
//! replicas/{origin}/{seq}.bin  Checkpoint (held for a peer)
//! ```
//!
//! Every write goes to `{key}.tmp` first and is then renamed over the final
//! key, falling back to copy + delete on backends without rename. The
//! manifest is written last and is the commit point for checkpoints.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cluster::checkpoint::Checkpoint;
use crate::cluster::election::PersistedElection;
use crate::cluster::membership::MembershipSnapshot;
use crate::cluster::retry::with_storage_policy;
use crate::constants::STATE_PREFIX;
use crate::error::{CoordError, Result};
use crate::types::{CheckpointSeq, NodeId};

/// Index of committed checkpoints; written after the checkpoint objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub committed: Vec<CheckpointSeq>,
    pub next_sequence: CheckpointSeq,
}

/// Everything recovered at startup.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub election: Option<PersistedElection>,
    pub membership: Option<MembershipSnapshot>,
    pub checkpoints: Vec<Checkpoint>,
    pub next_sequence: CheckpointSeq,
    /// Copies held for peers, oldest first per origin.
    pub replicas: BTreeMap<NodeId, Vec<Checkpoint>>,
}

#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("prefix", &self.prefix).finish()
    }
}

impl StateStore {
    pub fn new(store: Arc<dyn ObjectStore>, node: NodeId) -> Self {
        Self {
            store,
            prefix: format!("{}/{}", STATE_PREFIX, node.value()),
        }
    }

    pub fn in_memory(node: NodeId) -> Self {
        Self::new(Arc::new(InMemory::new()), node)
    }

    /// Filesystem-backed store rooted at `path`, created if missing.
    pub fn local(path: impl AsRef<Path>, node: NodeId) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| {
            CoordError::Config(format!(
                "failed to create data directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let store = LocalFileSystem::new_with_prefix(path)?;
        info!(path = %path.display(), node = %node, "Using local filesystem state store");
        Ok(Self::new(Arc::new(store), node))
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    fn path(&self, key: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", self.prefix, key))
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = Bytes::from(bincode::serialize(value)?);
        let temp = self.path(&format!("{}.tmp", key));
        let target = self.path(key);

        with_storage_policy(
            || {
                let store = self.store.clone();
                let temp = temp.clone();
                let payload = payload.clone();
                async move { store.put(&temp, payload.into()).await.map(|_| ()) }
            },
            |e: &object_store::Error| !matches!(e, object_store::Error::NotSupported { .. }),
        )
        .await
        .map_err(|e| {
            error!(error = %e, path = %temp, "Failed to write temp object");
            CoordError::Storage(e)
        })?;

        if let Err(e) = self.store.rename(&temp, &target).await {
            if let Err(copy_err) = self.store.copy(&temp, &target).await {
                error!(error = %copy_err, path = %target, "Failed to copy temp object into place");
                let _ = self.store.delete(&temp).await;
                return Err(copy_err.into());
            }
            let _ = self.store.delete(&temp).await;
            debug!(error = %e, path = %target, "Used copy+delete fallback (rename not supported)");
        }
        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path(key);
        let bytes = match self.store.get(&path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = bincode::deserialize(&bytes).map_err(|e| {
            error!(error = %e, path = %path, bytes_len = bytes.len(), "Stored state is corrupted");
            CoordError::Codec(e)
        })?;
        Ok(Some(value))
    }

    async fn remove(&self, key: &str) {
        match self.store.delete(&self.path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => debug!(error = %e, key, "Failed to delete stale object"),
        }
    }

    pub async fn save_election(&self, election: &PersistedElection) -> Result<()> {
        self.write("election.bin", election).await
    }

    pub async fn load_election(&self) -> Result<Option<PersistedElection>> {
        self.read("election.bin").await
    }

    pub async fn save_membership(&self, snapshot: &MembershipSnapshot) -> Result<()> {
        self.write("membership.bin", snapshot).await
    }

    pub async fn load_membership(&self) -> Result<Option<MembershipSnapshot>> {
        self.read("membership.bin").await
    }

    /// Persist a committed checkpoint and rewrite the manifest.
    ///
    /// Checkpoints that fell out of `manifest.committed` are deleted.
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint, manifest: &CheckpointManifest) -> Result<()> {
        self.write(&checkpoint_key(checkpoint.sequence), checkpoint).await?;
        let previous = self.load_manifest().await?.unwrap_or_default();
        self.write("checkpoints/manifest.bin", manifest).await?;

        for stale in previous
            .committed
            .iter()
            .filter(|s| !manifest.committed.contains(s))
        {
            self.remove(&checkpoint_key(*stale)).await;
        }
        debug!(sequence = %checkpoint.sequence, "Persisted checkpoint");
        Ok(())
    }

    pub async fn load_manifest(&self) -> Result<Option<CheckpointManifest>> {
        self.read("checkpoints/manifest.bin").await
    }

    /// Persist a copy held on behalf of `origin`.
    pub async fn save_replica(&self, origin: NodeId, checkpoint: &Checkpoint) -> Result<()> {
        self.write(&replica_key(origin, checkpoint.sequence), checkpoint).await
    }

    pub async fn load_replica(&self, origin: NodeId, sequence: CheckpointSeq) -> Result<Option<Checkpoint>> {
        self.read(&replica_key(origin, sequence)).await
    }

    pub async fn remove_replica(&self, origin: NodeId, sequence: CheckpointSeq) {
        self.remove(&replica_key(origin, sequence)).await;
    }

    /// Every replica copy on disk, grouped by origin.
    ///
    /// Leftover `.tmp` objects and names that do not parse are ignored; a
    /// copy that fails verification is skipped with a warning.
    pub async fn load_replicas(&self) -> Result<BTreeMap<NodeId, Vec<Checkpoint>>> {
        let root = self.path("replicas");
        let origins = self.store.list_with_delimiter(Some(&root)).await?;

        let mut replicas = BTreeMap::new();
        for dir in origins.common_prefixes {
            let Some(origin) = dir.filename().and_then(|name| name.parse::<u64>().ok()) else {
                continue;
            };
            let origin = NodeId(origin);
            let listing = self.store.list_with_delimiter(Some(&dir)).await?;
            let mut sequences: Vec<CheckpointSeq> = listing
                .objects
                .iter()
                .filter_map(|meta| meta.location.filename()?.strip_suffix(".bin")?.parse().ok())
                .map(CheckpointSeq)
                .collect();
            sequences.sort();

            let mut copies = Vec::with_capacity(sequences.len());
            for sequence in sequences {
                match self.load_replica(origin, sequence).await {
                    Ok(Some(copy)) => match copy.verify() {
                        Ok(()) => copies.push(copy),
                        Err(e) => warn!(origin = %origin, sequence = %sequence, error = %e, "Skipping corrupt replica copy"),
                    },
                    Ok(None) => {}
                    Err(e) => warn!(origin = %origin, sequence = %sequence, error = %e, "Failed to read replica copy"),
                }
            }
            if !copies.is_empty() {
                replicas.insert(origin, copies);
            }
        }
        Ok(replicas)
    }

    /// Load everything persisted for this node.
    ///
    /// A manifest entry whose checkpoint is missing or fails verification is
    /// skipped with a warning; the remaining checkpoints stay usable.
    pub async fn recover(&self) -> Result<RecoveredState> {
        let election = self.load_election().await?;
        let membership = self.load_membership().await?;
        let manifest = self.load_manifest().await?.unwrap_or_default();

        let mut checkpoints = Vec::with_capacity(manifest.committed.len());
        for sequence in &manifest.committed {
            match self.read::<Checkpoint>(&checkpoint_key(*sequence)).await {
                Ok(Some(checkpoint)) => match checkpoint.verify() {
                    Ok(()) => checkpoints.push(checkpoint),
                    Err(e) => warn!(sequence = %sequence, error = %e, "Skipping corrupt checkpoint"),
                },
                Ok(None) => warn!(sequence = %sequence, "Checkpoint listed in manifest is missing"),
                Err(e) => warn!(sequence = %sequence, error = %e, "Failed to read checkpoint"),
            }
        }

        let replicas = self.load_replicas().await?;

        if election.is_some() || !checkpoints.is_empty() || !replicas.is_empty() {
            info!(
                prefix = %self.prefix,
                checkpoints = checkpoints.len(),
                replica_origins = replicas.len(),
                term = ?election.map(|e| e.term),
                "Recovered persisted state"
            );
        }

        Ok(RecoveredState {
            election,
            membership,
            checkpoints,
            next_sequence: manifest.next_sequence,
            replicas,
        })
    }
}

fn checkpoint_key(sequence: CheckpointSeq) -> String {
    format!("checkpoints/{}.bin", sequence.value())
}

fn replica_key(origin: NodeId, sequence: CheckpointSeq) -> String {
    format!("replicas/{}/{}.bin", origin.value(), sequence.value())
}
