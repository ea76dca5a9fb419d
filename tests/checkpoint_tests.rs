//! Checkpoint and chain replication tests.

mod common;

use std::time::Duration;

use common::{TestCluster, WAIT, test_config};
use meshcoord::cluster::{Engine, EngineConfig, EngineEvent, InMemoryNetwork, MemberStatus, StateStore};
use meshcoord::error::CoordError;
use meshcoord::types::{CheckpointSeq, NodeId};
use tempfile::TempDir;

// ============================================================================
// Single node
// ============================================================================

#[tokio::test]
async fn test_restore_then_checkpoint_reproduces_digest() {
    let cluster = TestCluster::start(1).await;
    cluster.wait_for_leader().await;
    let node = cluster.node(1);

    node.request_resource("printer").await.unwrap();
    let first = node.force_checkpoint().await.unwrap();
    assert_eq!(first.members, 1);

    node.release_resource("printer").await.unwrap();
    let restored = node.restore(first.sequence).await.unwrap();
    assert_eq!(restored.sequence, first.sequence);

    let stats = node.statistics().await.unwrap();
    assert!(stats.held_resources.contains("printer"));

    let second = node.force_checkpoint().await.unwrap();
    assert!(second.sequence > first.sequence);
    assert_eq!(second.digest, first.digest);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_restore_picks_latest_at_or_below() {
    let cluster = TestCluster::start(1).await;
    cluster.wait_for_leader().await;
    let node = cluster.node(1);

    let first = node.force_checkpoint().await.unwrap();
    node.request_resource("printer").await.unwrap();
    let second = node.force_checkpoint().await.unwrap();
    assert_ne!(first.digest, second.digest);

    let restored = node.restore(CheckpointSeq(second.sequence.0 + 10)).await.unwrap();
    assert_eq!(restored.sequence, second.sequence);
    let restored = node.restore(first.sequence).await.unwrap();
    assert_eq!(restored.digest, first.digest);
    assert!(node.statistics().await.unwrap().held_resources.is_empty());

    let listed = node.checkpoints().await.unwrap();
    assert_eq!(listed.len(), 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_restore_without_checkpoint() {
    let cluster = TestCluster::start(1).await;
    let err = cluster.node(1).restore(CheckpointSeq(5)).await.unwrap_err();
    assert!(matches!(err, CoordError::CheckpointNotFound(CheckpointSeq(5))));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_commit_is_published() {
    let cluster = TestCluster::start(1).await;
    cluster.wait_for_leader().await;
    let mut events = cluster.node(1).subscribe();

    let info = cluster.node(1).force_checkpoint().await.unwrap();
    let event = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(EngineEvent::CheckpointCommitted { sequence, digest }) = events.recv().await {
                return (sequence, digest);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event, (info.sequence, info.digest));
    cluster.shutdown().await;
}

// ============================================================================
// Chain replication
// ============================================================================

#[tokio::test]
async fn test_checkpoint_replicated_down_the_chain() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();
    let cluster = TestCluster::start_with(3, |config| {
        let config = if config.node_id == NodeId(1) {
            config.with_replica_chain([NodeId(2), NodeId(3)])
        } else {
            config
        };
        if config.node_id == NodeId(3) {
            config.with_data_path(path.clone())
        } else {
            config
        }
    })
    .await;
    cluster.wait_for_leader().await;

    let info = cluster.node(1).force_checkpoint().await.unwrap();
    assert_eq!(info.members, 3);
    cluster.shutdown().await;

    // the tail persisted its copy before acknowledging
    let store = StateStore::local(dir.path(), NodeId(3)).unwrap();
    let replica = store
        .load_replica(NodeId(1), info.sequence)
        .await
        .unwrap()
        .expect("tail holds a replica");
    assert_eq!(replica.digest, info.digest);
    assert!(replica.verify().is_ok());
}

#[tokio::test]
async fn test_unreachable_tail_times_out() {
    let cluster = TestCluster::start_with(3, |config| {
        if config.node_id == NodeId(1) {
            config.with_replica_chain([NodeId(2), NodeId(3)])
        } else {
            config
        }
    })
    .await;
    cluster.wait_for_leader().await;

    let mut events = cluster.node(1).subscribe();
    cluster.network.disconnect(NodeId(2), NodeId(3));
    let err = cluster.node(1).force_checkpoint().await.unwrap_err();
    assert!(matches!(
        err,
        CoordError::ReplicationTimeout {
            replica: NodeId(3),
            ..
        }
    ));
    let mut suspected = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::MembershipChanged {
            node: NodeId(3),
            to: MemberStatus::Suspected,
            ..
        } = event
        {
            suspected = true;
        }
    }
    assert!(suspected, "silent replica was not suspected");
    assert!(cluster.node(1).checkpoints().await.unwrap().is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_one_checkpoint_in_flight() {
    let cluster = TestCluster::start_with(2, |config| {
        if config.node_id == NodeId(1) {
            config.with_replica_chain([NodeId(2)])
        } else {
            config
        }
    })
    .await;
    cluster.wait_for_leader().await;

    cluster.network.isolate(NodeId(2));
    let origin = cluster.node(1).clone();
    let first = tokio::spawn(async move { origin.force_checkpoint().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = cluster.node(1).force_checkpoint().await.unwrap_err();
    assert!(matches!(err, CoordError::CheckpointInProgress(_)));
    assert!(matches!(
        first.await.unwrap(),
        Err(CoordError::ReplicationTimeout { .. })
    ));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_replica_is_skipped() {
    let cluster = TestCluster::start_with(3, |config| {
        if config.node_id == NodeId(1) {
            config.with_replica_chain([NodeId(2), NodeId(3)])
        } else {
            config
        }
    })
    .await;
    cluster.wait_for_leader().await;

    cluster.network.isolate(NodeId(3));
    cluster.node(1).mark_failed(NodeId(3)).await.unwrap();
    let info = cluster.node(1).force_checkpoint().await.unwrap();
    assert_eq!(cluster.node(1).checkpoints().await.unwrap(), vec![info]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_restarted_origin_restores_from_recovered_tail() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();
    let customize = move |config: EngineConfig| match config.node_id {
        NodeId(1) => config.with_replica_chain([NodeId(2), NodeId(3)]),
        NodeId(3) => config.with_data_path(path.clone()),
        _ => config,
    };
    let mut cluster = TestCluster::start_with(3, &customize).await;
    cluster.wait_for_leader().await;
    let info = cluster.node(1).force_checkpoint().await.unwrap();

    // the tail reloads its copy from disk
    cluster.nodes[2].shutdown().await.unwrap();
    cluster.nodes[2] = Engine::connect(customize(test_config(3, &[1, 2, 3])), &cluster.network)
        .await
        .unwrap();

    // the origin comes back with nothing
    cluster.nodes[0].shutdown().await.unwrap();
    cluster.nodes[0] = Engine::connect(customize(test_config(1, &[1, 2, 3])), &cluster.network)
        .await
        .unwrap();
    assert!(cluster.node(1).checkpoints().await.unwrap().is_empty());
    cluster.network.crash(NodeId(2));

    let restored = cluster.node(1).restore(info.sequence).await.unwrap();
    assert_eq!(restored, info);
    assert_eq!(cluster.node(1).checkpoints().await.unwrap(), vec![info.clone()]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_restore_fails_when_no_replica_has_a_copy() {
    let cluster = TestCluster::start_with(3, |config| {
        if config.node_id == NodeId(1) {
            config.with_replica_chain([NodeId(2), NodeId(3)])
        } else {
            config
        }
    })
    .await;
    cluster.wait_for_leader().await;

    let err = cluster.node(1).restore(CheckpointSeq(5)).await.unwrap_err();
    assert!(matches!(err, CoordError::CheckpointNotFound(CheckpointSeq(5))));
    cluster.shutdown().await;
}

// ============================================================================
// Durability
// ============================================================================

#[tokio::test]
async fn test_restart_recovers_checkpoints_and_term() {
    let dir = TempDir::new().unwrap();
    let config = || test_config(1, &[1]).with_data_path(dir.path());

    let network = InMemoryNetwork::new();
    let node = Engine::connect(config(), &network).await.unwrap();
    let elected = common::wait_until(WAIT, || {
        let state = node.election();
        async move { state.leader == Some(NodeId(1)) }
    })
    .await;
    assert!(elected);
    let before = node.election().term;
    let info = node.force_checkpoint().await.unwrap();
    node.shutdown().await.unwrap();
    assert!(!node.is_running());

    let network = InMemoryNetwork::new();
    let node = Engine::connect(config(), &network).await.unwrap();
    assert!(node.election().term >= before);
    assert_eq!(node.checkpoints().await.unwrap(), vec![info.clone()]);
    let restored = node.restore(info.sequence).await.unwrap();
    assert_eq!(restored.digest, info.digest);

    // sequence numbers continue after a restart
    let next = node.force_checkpoint().await.unwrap();
    assert!(next.sequence > info.sequence);
    node.shutdown().await.unwrap();
}
