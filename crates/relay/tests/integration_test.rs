//! End-to-end election through a live relay

use std::time::Duration;

use beacon_coordination::{
    LeaderElection, LeaderElectionConfig, LeaderEvent, Presence, PresenceConfig,
};
use beacon_realtime::{ParticipantId, RealtimeClient};
use beacon_realtime_ws::{WebSocketOptions, WebSocketTransport};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use url::Url;

async fn start_relay() -> (Url, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("no local addr");
    let shutdown = CancellationToken::new();

    tokio::spawn(beacon_relay::serve(listener, "/ws", 64, shutdown.clone()));

    (Url::parse(&format!("ws://{addr}/ws")).unwrap(), shutdown)
}

fn participant(url: &Url, id: &str) -> LeaderElection {
    let transport = WebSocketTransport::new(WebSocketOptions::new(url.clone()).unwrap());
    let client = RealtimeClient::with_id(transport, ParticipantId::from(id));
    let presence = Presence::new(
        client,
        PresenceConfig {
            heartbeat_interval: Duration::from_millis(200),
            housekeeping_interval: Duration::from_millis(50),
            timeout_factor: 3.5,
        },
        serde_json::Value::Null,
    );

    LeaderElection::new(
        presence,
        LeaderElectionConfig {
            warmup: Duration::from_millis(500),
            react_delay: Duration::from_millis(100),
            notify_debounce: Duration::from_millis(20),
            allow_leader_demotion: false,
        },
    )
}

async fn next_change(events: &flume::Receiver<LeaderEvent>) -> bool {
    timeout(Duration::from_secs(10), async {
        loop {
            if let LeaderEvent::LeadershipStateChanged { is_leader } =
                events.recv_async().await.expect("election shut down")
            {
                return is_leader;
            }
        }
    })
    .await
    .expect("Timeout")
}

#[tokio::test]
async fn test_participants_elect_one_leader_through_relay() {
    let _ = tracing_subscriber::fmt::try_init();

    let (url, shutdown) = start_relay().await;

    let a = participant(&url, "a");
    let b = participant(&url, "b");
    let a_events = a.subscribe();
    let b_events = b.subscribe();

    a.presence().client().connect().await.unwrap();
    b.presence().client().connect().await.unwrap();

    assert!(next_change(&a_events).await);
    assert!(!next_change(&b_events).await);
    assert_eq!(b.leader(), Some(ParticipantId::from("a")));

    a.shutdown().await.unwrap();
    assert!(next_change(&b_events).await);

    b.shutdown().await.unwrap();
    shutdown.cancel();
}
