//! Leader election scenarios

mod common;

use std::time::Duration;

use beacon_coordination::{LeaderElectionConfig, leader_election};
use beacon_realtime::ParticipantId;
use beacon_realtime_memory::MemoryHub;
use common::{Node, election_config, next_leadership_change, settle};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_two_participants_agree_on_lowest_id() {
    let _ = tracing_subscriber::fmt::try_init();

    let hub = MemoryHub::new();
    let a = Node::new(&hub, "a", json!(null));
    let b = Node::new(&hub, "b", json!(null));

    a.connect().await;
    b.connect().await;

    settle(Duration::from_secs(10)).await;

    // Exactly one transition each, no flapping
    assert_eq!(a.leadership_changes(), vec![true]);
    assert_eq!(b.leadership_changes(), vec![false]);
    assert_eq!(a.election.leader(), Some(ParticipantId::from("a")));
    assert_eq!(b.election.leader(), Some(ParticipantId::from("a")));

    // Only the leader publishes the flag
    assert_eq!(a.election.presence().local_state()["isLeader"], json!(true));
    assert_eq!(b.election.presence().local_state()["isLeader"], json!(false));
}

#[tokio::test(start_paused = true)]
async fn test_single_leader_among_many() {
    let hub = MemoryHub::new();
    let nodes = ["e", "c", "a", "d", "b"]
        .into_iter()
        .map(|id| Node::new(&hub, id, json!({ "name": id })))
        .collect::<Vec<_>>();

    for node in &nodes {
        node.connect().await;
        settle(Duration::from_millis(100)).await;
    }

    settle(Duration::from_secs(15)).await;

    let leaders = nodes.iter().filter(|n| n.election.is_leader()).count();
    assert_eq!(leaders, 1);

    for node in &nodes {
        assert_eq!(node.election.leader(), Some(ParticipantId::from("a")));
    }
}

#[tokio::test(start_paused = true)]
async fn test_follower_takes_over_when_leader_leaves() {
    let hub = MemoryHub::new();
    let a = Node::new(&hub, "a", json!(null));
    let b = Node::new(&hub, "b", json!(null));
    a.connect().await;
    b.connect().await;

    // a may first report following b before its warm-up pass claims
    while !next_leadership_change(&a.leader_events).await {}
    assert!(!next_leadership_change(&b.leader_events).await);

    a.election.shutdown().await.unwrap();

    assert!(next_leadership_change(&b.leader_events).await);
    assert_eq!(b.election.leader(), Some(ParticipantId::from("b")));
}

#[tokio::test(start_paused = true)]
async fn test_crashed_leader_is_replaced_after_timeout() {
    let hub = MemoryHub::new();
    let a = Node::new(&hub, "a", json!(null));
    let b = Node::new(&hub, "b", json!(null));
    a.connect().await;
    b.connect().await;

    // a may first report following b before its warm-up pass claims
    while !next_leadership_change(&a.leader_events).await {}
    assert!(!next_leadership_change(&b.leader_events).await);

    let crashed_at = tokio::time::Instant::now();
    a.transport.disconnect();

    // The isolated leader steps down at once
    assert!(!next_leadership_change(&a.leader_events).await);

    assert!(next_leadership_change(&b.leader_events).await);
    assert!(crashed_at.elapsed() >= Duration::from_millis(2500));
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_does_not_depose_leader() {
    let hub = MemoryHub::new();
    let b = Node::new(&hub, "b", json!(null));
    b.connect().await;

    assert!(next_leadership_change(&b.leader_events).await);

    // Sorts first, but a leader already exists
    let a = Node::new(&hub, "a", json!(null));
    a.connect().await;

    assert!(!next_leadership_change(&a.leader_events).await);

    settle(Duration::from_secs(10)).await;

    assert_eq!(a.leadership_changes(), Vec::<bool>::new());
    assert_eq!(b.leadership_changes(), Vec::<bool>::new());
    assert_eq!(a.election.leader(), Some(ParticipantId::from("b")));
    assert!(b.election.is_leader());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cascades_and_is_idempotent() {
    let hub = MemoryHub::new();
    let a = Node::new(&hub, "a", json!(null));
    a.connect().await;

    a.election.shutdown().await.unwrap();
    a.election.shutdown().await.unwrap();

    assert!(a.election.presence().is_shut_down());
    assert!(a.election.presence().client().is_shut_down());
    assert_eq!(hub.connected_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_better_ranked_joiner_demotes_leader_when_allowed() {
    let hub = MemoryHub::new();
    let config = LeaderElectionConfig {
        allow_leader_demotion: true,
        ..election_config()
    };
    let node = |id: &str| {
        Node::build(
            hub.transport(),
            id,
            json!(null),
            leader_election::by_id(),
            config.clone(),
        )
    };

    let b = node("b");
    b.connect().await;
    assert!(next_leadership_change(&b.leader_events).await);

    let a = node("a");
    a.connect().await;

    // a may first report following b before its warm-up pass claims
    while !next_leadership_change(&a.leader_events).await {}
    assert!(!next_leadership_change(&b.leader_events).await);

    settle(Duration::from_secs(5)).await;

    assert!(a.election.is_leader());
    assert!(!b.election.is_leader());
    assert_eq!(a.election.leader(), Some(ParticipantId::from("a")));
    assert_eq!(b.election.leader(), Some(ParticipantId::from("a")));
    assert!(a.leadership_changes().is_empty());
    assert!(b.leadership_changes().is_empty());
}
