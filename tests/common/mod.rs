//! Shared harness for multi-engine tests.
//!
//! Engines run on one [`InMemoryNetwork`] with timings short enough that a
//! whole election or agreement finishes in well under a second.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use meshcoord::cluster::{Engine, EngineConfig, EngineHandle, InMemoryNetwork, MemberStatus, Role};
use meshcoord::types::NodeId;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn test_config(node: u64, seeds: &[u64]) -> EngineConfig {
    EngineConfig::new(NodeId(node))
        .with_seed_members(seeds.iter().copied().map(NodeId))
        .with_election_timeout(Duration::from_millis(300))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_startup_grace_period(Duration::from_millis(100))
        .with_agreement_timeout(Duration::from_millis(600))
        .with_replication_timeout(Duration::from_millis(300))
        .with_checkpoint_interval(None)
}

pub struct TestCluster {
    pub network: InMemoryNetwork,
    pub nodes: Vec<EngineHandle>,
}

impl TestCluster {
    /// Start nodes `1..=n`, all seeded with each other.
    pub async fn start(n: u64) -> Self {
        Self::start_with(n, |config| config).await
    }

    pub async fn start_with(n: u64, customize: impl Fn(EngineConfig) -> EngineConfig) -> Self {
        let network = InMemoryNetwork::new();
        let seeds: Vec<u64> = (1..=n).collect();
        let mut nodes = Vec::new();
        for id in 1..=n {
            let config = customize(test_config(id, &seeds));
            nodes.push(Engine::connect(config, &network).await.expect("engine starts"));
        }
        Self { network, nodes }
    }

    pub fn node(&self, id: u64) -> &EngineHandle {
        &self.nodes[(id - 1) as usize]
    }

    /// Wait until every node in `among` recognises the same leader, itself
    /// one of `among` and acting as leader.
    pub async fn wait_for_leader_among(&self, among: &[u64]) -> NodeId {
        let mut found = None;
        let agreed = wait_until(WAIT, || {
            let states: Vec<_> = among.iter().map(|id| self.node(*id).election()).collect();
            let leader = states[0].leader;
            let settled = leader.is_some()
                && states
                    .iter()
                    .all(|s| s.leader == leader && s.term == states[0].term);
            let leader_ready = leader
                .and_then(|l| among.iter().find(|id| NodeId(**id) == l))
                .is_some_and(|id| self.node(*id).election().role == Role::Leader);
            found = leader;
            async move { settled && leader_ready }
        })
        .await;
        assert!(agreed, "nodes {:?} did not agree on a leader", among);
        found.expect("leader")
    }

    pub async fn wait_for_leader(&self) -> NodeId {
        let all: Vec<u64> = (1..=self.nodes.len() as u64).collect();
        self.wait_for_leader_among(&all).await
    }

    /// Wait until `observer` sees `node` in `status`.
    pub async fn wait_for_status(&self, observer: u64, node: u64, status: MemberStatus) {
        let handle = self.node(observer);
        let reached = wait_until(WAIT, || {
            let current = handle.membership().status_of(NodeId(node));
            async move { current == Some(status) }
        })
        .await;
        assert!(
            reached,
            "node {} never saw node {} as {}",
            observer, node, status
        );
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            let _ = node.shutdown().await;
        }
    }
}

/// Poll `check` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
