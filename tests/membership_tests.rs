//! Membership, failure detection and engine lifecycle tests.

mod common;

use common::{TestCluster, WAIT, test_config, wait_until};
use meshcoord::cluster::{
    CausalOrdering, Engine, EngineEvent, MemberStatus, TaskStatus, vector_clock,
};
use meshcoord::error::CoordError;
use meshcoord::types::NodeId;

// ============================================================================
// Membership changes
// ============================================================================

#[tokio::test]
async fn test_joining_node_becomes_active_everywhere() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_for_leader().await;

    let newcomer = Engine::connect(test_config(4, &[1, 2, 3]), &cluster.network)
        .await
        .unwrap();
    let before = cluster.node(1).membership().version;
    let version = cluster.node(1).join_cluster(NodeId(4)).await.unwrap();
    assert!(version > before);

    for observer in 1..=3 {
        cluster.wait_for_status(observer, 4, MemberStatus::Active).await;
    }
    let reached = wait_until(WAIT, || {
        let status = newcomer.membership().status_of(NodeId(4));
        async move { status == Some(MemberStatus::Active) }
    })
    .await;
    assert!(reached, "newcomer never learned it is active");

    newcomer.shutdown().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_join_is_idempotent() {
    let cluster = TestCluster::start(2).await;
    let first = cluster.node(1).join_cluster(NodeId(9)).await.unwrap();
    let second = cluster.node(1).join_cluster(NodeId(9)).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        cluster.node(1).membership().status_of(NodeId(9)),
        Some(MemberStatus::Joining)
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leave_spreads_by_gossip() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_for_leader().await;

    cluster.node(1).leave_cluster(NodeId(3)).await.unwrap();
    cluster.wait_for_status(2, 3, MemberStatus::Left).await;

    // a departed member no longer counts toward the quorum base
    let stats = cluster.node(2).statistics().await.unwrap();
    assert_eq!(stats.members_by_status["left"], 1);
    assert_eq!(stats.members_by_status["active"], 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_silent_node_is_suspected() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_for_leader().await;

    cluster.network.isolate(NodeId(3));
    cluster.wait_for_status(1, 3, MemberStatus::Suspected).await;
    cluster.wait_for_status(2, 3, MemberStatus::Suspected).await;
    // suspicion alone never fails a node
    assert_eq!(
        cluster.node(1).membership().status_of(NodeId(3)),
        Some(MemberStatus::Suspected)
    );

    cluster.network.heal();
    cluster.wait_for_status(1, 3, MemberStatus::Active).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unknown_member_rejected() {
    let cluster = TestCluster::start(1).await;
    let err = cluster.node(1).mark_failed(NodeId(9)).await.unwrap_err();
    assert!(matches!(err, CoordError::UnknownMember(NodeId(9))));
    let err = cluster.node(1).leave_cluster(NodeId(9)).await.unwrap_err();
    assert!(matches!(err, CoordError::UnknownMember(NodeId(9))));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_departed_member_cannot_fail() {
    let cluster = TestCluster::start(3).await;
    cluster.node(1).leave_cluster(NodeId(3)).await.unwrap();
    let err = cluster.node(1).mark_failed(NodeId(3)).await.unwrap_err();
    assert!(matches!(
        err,
        CoordError::InvalidTransition {
            node: NodeId(3),
            from: MemberStatus::Left,
            to: MemberStatus::Failed,
        }
    ));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_membership_events_are_published() {
    let cluster = TestCluster::start(2).await;
    let mut events = cluster.node(1).subscribe();
    let version = cluster.node(1).join_cluster(NodeId(5)).await.unwrap();

    let event = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(event @ EngineEvent::MembershipChanged { .. }) = events.recv().await {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        event,
        EngineEvent::MembershipChanged {
            version,
            node: NodeId(5),
            from: None,
            to: MemberStatus::Joining,
        }
    );
    cluster.shutdown().await;
}

// ============================================================================
// Causal history and statistics
// ============================================================================

#[tokio::test]
async fn test_causal_history_never_puts_effect_before_cause() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_for_leader().await;
    cluster.node(2).request_resource("printer").await.unwrap();
    cluster.node(2).release_resource("printer").await.unwrap();
    cluster.node(1).join_cluster(NodeId(7)).await.unwrap();

    let history = cluster.node(1).causal_history().await.unwrap();
    assert!(!history.is_empty());
    for (i, earlier) in history.iter().enumerate() {
        for later in &history[i + 1..] {
            assert_ne!(
                vector_clock::compare(&later.clock, &earlier.clock),
                CausalOrdering::Before,
                "'{}' listed after its effect '{}'",
                later.description,
                earlier.description
            );
        }
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_statistics_reflect_engine_state() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.wait_for_leader().await;
    let node = cluster.node(leader.0);
    node.request_resource("printer").await.unwrap();

    let stats = node.statistics().await.unwrap();
    assert_eq!(stats.node, leader);
    assert_eq!(stats.leader, Some(leader));
    assert_eq!(stats.members_by_status["active"], 3);
    assert!(stats.held_resources.contains("printer"));
    assert!(stats.causal_events > 0);
    assert_eq!(stats.committed_checkpoints, 0);
    assert_eq!(stats.last_checkpoint, None);

    let tasks: Vec<&str> = stats.background_tasks.iter().map(|(name, _)| *name).collect();
    assert_eq!(tasks, vec!["failure_check", "heartbeat", "link_acceptor"]);
    assert!(
        stats
            .background_tasks
            .iter()
            .all(|(_, status)| *status == TaskStatus::Running)
    );
    cluster.shutdown().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_operations_after_shutdown_fail() {
    let cluster = TestCluster::start(1).await;
    let node = cluster.node(1).clone();
    node.shutdown().await.unwrap();

    assert!(!node.is_running());
    assert!(matches!(node.statistics().await, Err(CoordError::Shutdown)));
    assert!(matches!(
        node.request_resource("printer").await,
        Err(CoordError::Shutdown)
    ));
    assert!(matches!(
        node.report_health(NodeId(2), None).await,
        Err(CoordError::Shutdown)
    ));
}

#[tokio::test]
async fn test_engine_rejects_invalid_config() {
    let network = meshcoord::cluster::InMemoryNetwork::new();
    let config = test_config(1, &[1]).with_heartbeat_interval(std::time::Duration::from_secs(5));
    let err = Engine::connect(config, &network).await.unwrap_err();
    assert!(matches!(err, CoordError::Config(_)));
}
