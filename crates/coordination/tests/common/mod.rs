//! Shared helpers for multi-participant scenarios
//!
//! Every scenario runs on one in-memory hub with shortened timings, under
//! paused tokio time.

#![allow(dead_code)]

use std::time::Duration;

use beacon_coordination::{
    LeaderElection, LeaderElectionConfig, LeaderEvent, ParticipantComparator, Presence,
    PresenceConfig, PresenceEvent, leader_election,
};
use beacon_realtime::{ParticipantId, RealtimeClient};
use beacon_realtime_memory::{MemoryHub, MemoryOptions, MemoryTransport};
use serde_json::Value;
use tokio::time::timeout;

/// Heartbeat every second, evict after 3.5s of silence.
pub fn presence_config() -> PresenceConfig {
    PresenceConfig {
        heartbeat_interval: Duration::from_secs(1),
        housekeeping_interval: Duration::from_millis(100),
        timeout_factor: 3.5,
    }
}

/// Two second warm-up, 200ms react delay.
pub fn election_config() -> LeaderElectionConfig {
    LeaderElectionConfig {
        warmup: Duration::from_secs(2),
        react_delay: Duration::from_millis(200),
        notify_debounce: Duration::from_millis(50),
        allow_leader_demotion: false,
    }
}

/// A transport that delivers every inbound packet twice.
pub fn duplicating(hub: &MemoryHub) -> MemoryTransport {
    hub.transport_with_options(MemoryOptions {
        duplicate_delivery: true,
    })
}

/// A participant attached to the hub.
pub struct Node {
    pub election: LeaderElection,
    pub transport: MemoryTransport,
    pub leader_events: flume::Receiver<LeaderEvent>,
    pub presence_events: flume::Receiver<PresenceEvent>,
}

impl Node {
    /// Builds a participant ranked by id. Call [`Node::connect`] to join.
    pub fn new(hub: &MemoryHub, id: &str, data: Value) -> Self {
        Self::with_comparator(hub, id, data, leader_election::by_id())
    }

    /// Builds a participant ranked by `comparator`.
    pub fn with_comparator(
        hub: &MemoryHub,
        id: &str,
        data: Value,
        comparator: ParticipantComparator,
    ) -> Self {
        Self::build(hub.transport(), id, data, comparator, election_config())
    }

    /// Builds a participant on an existing transport.
    pub fn build(
        transport: MemoryTransport,
        id: &str,
        data: Value,
        comparator: ParticipantComparator,
        config: LeaderElectionConfig,
    ) -> Self {
        let client = RealtimeClient::with_id(transport.clone(), ParticipantId::from(id));
        let presence = Presence::new(client, presence_config(), data);
        let presence_events = presence.subscribe();
        let election = LeaderElection::with_comparator(presence, config, comparator);
        let leader_events = election.subscribe();

        Self {
            election,
            transport,
            leader_events,
            presence_events,
        }
    }

    pub async fn connect(&self) {
        self.election
            .presence()
            .client()
            .connect()
            .await
            .expect("connect failed");
    }

    pub fn id(&self) -> &ParticipantId {
        self.election.presence().id()
    }

    /// Leadership transitions reported so far, in order.
    pub fn leadership_changes(&self) -> Vec<bool> {
        self.leader_events
            .drain()
            .filter_map(|event| match event {
                LeaderEvent::LeadershipStateChanged { is_leader } => Some(is_leader),
                LeaderEvent::LeaderRequested => None,
            })
            .collect()
    }
}

/// Waits for the next leadership transition of a participant.
pub async fn next_leadership_change(events: &flume::Receiver<LeaderEvent>) -> bool {
    timeout(Duration::from_secs(60), async {
        loop {
            match events.recv_async().await.expect("election shut down") {
                LeaderEvent::LeadershipStateChanged { is_leader } => return is_leader,
                LeaderEvent::LeaderRequested => {}
            }
        }
    })
    .await
    .expect("timed out waiting for leadership change")
}

/// Lets timers run for `duration` of virtual time.
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}
