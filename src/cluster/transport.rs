//! Message transport between engines.
//!
//! The engine sends encoded frames through a [`Transport`] and accepts
//! inbound links from a channel of [`InboundLink`]s, spawning one reader task
//! per link. Frames on a link arrive in order; nothing is assumed across
//! links.
//!
//! [`InMemoryNetwork`] runs many engines in one process and can partition,
//! isolate and heal nodes, which is how the multi-node tests exercise
//! elections, agreements and replication.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::cluster::metrics;
use crate::error::{CoordError, Result};
use crate::types::NodeId;

/// Outbound side of a node's network stack.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_id(&self) -> NodeId;

    /// Send one encoded frame to `to`.
    ///
    /// Loss is not an error: a frame dropped by the network returns `Ok`.
    async fn send(&self, to: NodeId, frame: Bytes) -> Result<()>;
}

/// An accepted link from a peer.
#[derive(Debug)]
pub struct InboundLink {
    pub peer: NodeId,
    pub frames: mpsc::UnboundedReceiver<Bytes>,
}

pub type LinkAcceptor = mpsc::UnboundedReceiver<InboundLink>;

#[derive(Default)]
struct NetworkInner {
    acceptors: DashMap<NodeId, mpsc::UnboundedSender<InboundLink>>,
    links: DashMap<(NodeId, NodeId), mpsc::UnboundedSender<Bytes>>,
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// In-process network connecting any number of engines.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("nodes", &self.inner.acceptors.len())
            .field("links", &self.inner.links.len())
            .finish()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `node`. Re-registering replaces the previous attachment and
    /// drops its links, like a process restart.
    pub fn register(&self, node: NodeId) -> (Arc<InMemoryTransport>, LinkAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.acceptors.insert(node, tx);
        self.inner.links.retain(|(from, to), _| *from != node && *to != node);
        debug!(node = %node, "Registered node on in-memory network");
        let transport = Arc::new(InMemoryTransport {
            node,
            network: self.clone(),
        });
        (transport, rx)
    }

    /// Detach `node` entirely; frames to it are lost.
    pub fn crash(&self, node: NodeId) {
        self.inner.acceptors.remove(&node);
        self.inner.links.retain(|(from, to), _| *from != node && *to != node);
        debug!(node = %node, "Node detached from in-memory network");
    }

    /// Drop traffic in both directions between `a` and `b`.
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.inner.blocked.write();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    /// Drop all traffic to and from `node`.
    pub fn isolate(&self, node: NodeId) {
        let peers: Vec<NodeId> = self.inner.acceptors.iter().map(|e| *e.key()).collect();
        let mut blocked = self.inner.blocked.write();
        for peer in peers.into_iter().filter(|p| *p != node) {
            blocked.insert((node, peer));
            blocked.insert((peer, node));
        }
    }

    /// Split the network into groups that cannot reach each other.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut blocked = self.inner.blocked.write();
        for (i, left) in groups.iter().enumerate() {
            for right in groups.iter().skip(i + 1) {
                for &a in left.iter() {
                    for &b in right.iter() {
                        blocked.insert((a, b));
                        blocked.insert((b, a));
                    }
                }
            }
        }
    }

    /// Remove every partition.
    pub fn heal(&self) {
        self.inner.blocked.write().clear();
        debug!("Healed in-memory network");
    }

    pub fn is_blocked(&self, from: NodeId, to: NodeId) -> bool {
        self.inner.blocked.read().contains(&(from, to))
    }

    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn drop_frame(&self, reason: &str) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::record_dropped(reason);
    }

    fn deliver(&self, from: NodeId, to: NodeId, frame: Bytes) -> Result<()> {
        if self.is_blocked(from, to) {
            trace!(from = %from, to = %to, "Frame dropped by partition");
            self.drop_frame("partitioned");
            return Ok(());
        }

        let key = (from, to);
        if let Some(link) = self.inner.links.get(&key) {
            if link.send(frame.clone()).is_ok() {
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
        // stale or missing link: open a new one
        self.inner.links.remove(&key);

        let Some(acceptor) = self.inner.acceptors.get(&to).map(|a| a.clone()) else {
            self.drop_frame("unreachable");
            return Ok(());
        };
        let (tx, rx) = mpsc::unbounded_channel();
        if acceptor.send(InboundLink { peer: from, frames: rx }).is_err() {
            self.drop_frame("unreachable");
            return Ok(());
        }
        tx.send(frame)
            .map_err(|_| CoordError::Transport(format!("link {} -> {} closed", from, to)))?;
        self.inner.links.insert(key, tx);
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A node's attachment to an [`InMemoryNetwork`].
#[derive(Debug)]
pub struct InMemoryTransport {
    node: NodeId,
    network: InMemoryNetwork,
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_id(&self) -> NodeId {
        self.node
    }

    async fn send(&self, to: NodeId, frame: Bytes) -> Result<()> {
        self.network.deliver(self.node, to, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_frame_opens_link() {
        let net = InMemoryNetwork::new();
        let (a, _) = net.register(NodeId(1));
        let (_b, mut acceptor) = net.register(NodeId(2));

        a.send(NodeId(2), Bytes::from_static(b"one")).await.unwrap();
        a.send(NodeId(2), Bytes::from_static(b"two")).await.unwrap();

        let mut link = acceptor.recv().await.unwrap();
        assert_eq!(link.peer, NodeId(1));
        assert_eq!(link.frames.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(link.frames.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert!(acceptor.try_recv().is_err());
        assert_eq!(net.delivered(), 2);
    }

    #[tokio::test]
    async fn test_partition_drops_frames() {
        let net = InMemoryNetwork::new();
        let (a, _) = net.register(NodeId(1));
        let (_b, mut acceptor) = net.register(NodeId(2));
        let (_c, _) = net.register(NodeId(3));

        net.partition(&[&[NodeId(1)], &[NodeId(2), NodeId(3)]]);
        a.send(NodeId(2), Bytes::from_static(b"lost")).await.unwrap();
        assert!(acceptor.try_recv().is_err());
        assert_eq!(net.dropped(), 1);
        assert!(!net.is_blocked(NodeId(2), NodeId(3)));

        net.heal();
        a.send(NodeId(2), Bytes::from_static(b"found")).await.unwrap();
        assert!(acceptor.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_isolate_blocks_both_directions() {
        let net = InMemoryNetwork::new();
        net.register(NodeId(1));
        net.register(NodeId(2));
        net.isolate(NodeId(1));
        assert!(net.is_blocked(NodeId(1), NodeId(2)));
        assert!(net.is_blocked(NodeId(2), NodeId(1)));
    }

    #[tokio::test]
    async fn test_send_to_crashed_node_is_lost() {
        let net = InMemoryNetwork::new();
        let (a, _) = net.register(NodeId(1));
        let (_b, acceptor) = net.register(NodeId(2));
        net.crash(NodeId(2));
        drop(acceptor);
        assert!(a.send(NodeId(2), Bytes::new()).await.is_ok());
        assert_eq!(net.dropped(), 1);
    }

    #[tokio::test]
    async fn test_reregister_opens_fresh_link() {
        let net = InMemoryNetwork::new();
        let (a, _) = net.register(NodeId(1));
        let (_b, old) = net.register(NodeId(2));
        a.send(NodeId(2), Bytes::from_static(b"x")).await.unwrap();
        drop(old);

        let (_b, mut acceptor) = net.register(NodeId(2));
        a.send(NodeId(2), Bytes::from_static(b"y")).await.unwrap();
        let mut link = acceptor.recv().await.unwrap();
        assert_eq!(link.frames.recv().await.unwrap(), Bytes::from_static(b"y"));
    }
}
