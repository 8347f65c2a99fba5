//! In-memory realtime transport implementation for testing
//!
//! A [`MemoryHub`] plays the role of the pub/sub medium: every packet published
//! by a connected [`MemoryTransport`] is fanned out to every connected transport
//! of the same hub, the sender included. Transports can be disconnected and
//! reconnected to exercise lifecycle handling, and can opt into duplicate
//! delivery to exercise at-least-once semantics.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use beacon_realtime::{
    Lifecycle, Packet, Transport, TransportError, TransportEvent, TransportEventStream,
};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Options for a memory transport
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryOptions {
    /// Deliver every inbound packet twice.
    pub duplicate_delivery: bool,
}

/// Shared in-process pub/sub medium
#[derive(Clone, Default)]
pub struct MemoryHub {
    peers: Arc<Mutex<HashMap<Uuid, Peer>>>,
}

#[derive(Clone)]
struct Peer {
    sender: flume::Sender<TransportEvent>,
    options: MemoryOptions,
}

impl MemoryHub {
    /// Create a new, empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this hub with default options
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        self.transport_with_options(MemoryOptions::default())
    }

    /// Create a transport attached to this hub
    #[must_use]
    pub fn transport_with_options(&self, options: MemoryOptions) -> MemoryTransport {
        let (sender, receiver) = flume::unbounded();

        MemoryTransport {
            id: Uuid::new_v4(),
            hub: self.clone(),
            options,
            sender,
            receiver,
            state: Arc::new(Mutex::new(ConnectionState::default())),
        }
    }

    /// Number of currently connected transports
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.peers.lock().len()
    }

    fn register(&self, id: Uuid, peer: Peer) {
        self.peers.lock().insert(id, peer);
    }

    fn unregister(&self, id: &Uuid) {
        self.peers.lock().remove(id);
    }

    fn broadcast(&self, packet: &Packet) {
        let peers = self.peers.lock().values().cloned().collect::<Vec<_>>();

        for peer in peers {
            let copies = if peer.options.duplicate_delivery { 2 } else { 1 };
            for _ in 0..copies {
                let _ = peer.sender.send(TransportEvent::Packet(packet.clone()));
            }
        }
    }
}

impl Debug for MemoryHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHub")
            .field("connected", &self.connected_count())
            .finish()
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    connected: bool,
    ever_connected: bool,
    shut_down: bool,
}

/// Memory transport implementation
#[derive(Clone)]
pub struct MemoryTransport {
    id: Uuid,
    hub: MemoryHub,
    options: MemoryOptions,
    sender: flume::Sender<TransportEvent>,
    receiver: flume::Receiver<TransportEvent>,
    state: Arc<Mutex<ConnectionState>>,
}

impl MemoryTransport {
    /// Whether this transport is currently attached to the hub
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Detach from the hub, simulating a dropped connection
    ///
    /// Emits `Disconnect` if the transport was connected. Packets published by
    /// other participants while disconnected are not delivered.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.connected, false)
        };

        if was_connected {
            self.hub.unregister(&self.id);
            debug!("Memory transport {} disconnected", self.id);
            let _ = self
                .sender
                .send(TransportEvent::Lifecycle(Lifecycle::Disconnect));
        }
    }

    fn emit(&self, lifecycle: Lifecycle) {
        let _ = self.sender.send(TransportEvent::Lifecycle(lifecycle));
    }
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let reconnect = {
            let mut state = self.state.lock();

            if state.shut_down {
                return Err(TransportError::ConnectionClosed);
            }

            if state.connected {
                return Ok(());
            }

            state.connected = true;
            std::mem::replace(&mut state.ever_connected, true)
        };

        self.hub.register(
            self.id,
            Peer {
                sender: self.sender.clone(),
                options: self.options,
            },
        );

        info!("Memory transport {} attached to hub", self.id);

        self.emit(if reconnect {
            Lifecycle::Reconnect
        } else {
            Lifecycle::Connect
        });
        self.emit(Lifecycle::Ready);

        Ok(())
    }

    async fn publish(&self, packet: Packet) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.hub.broadcast(&packet);

        Ok(())
    }

    fn events(&self) -> TransportEventStream {
        Box::pin(self.receiver.clone().into_stream())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.disconnect();
        self.state.lock().shut_down = true;

        debug!("Memory transport {} shut down", self.id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use beacon_realtime::ParticipantId;
    use futures::StreamExt;
    use serde_json::json;
    use tokio::time::timeout;

    fn packet(src: &str) -> Packet {
        Packet {
            src: ParticipantId::from(src),
            event: "queue:item".to_string(),
            data: json!({ "index": "001" }),
        }
    }

    async fn next(events: &mut TransportEventStream) -> TransportEvent {
        timeout(Duration::from_secs(1), events.next())
            .await
            .expect("timed out")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_connect_emits_connect_then_ready() {
        let _ = tracing_subscriber::fmt::try_init();

        let hub = MemoryHub::new();
        let transport = hub.transport();
        let mut events = transport.events();

        transport.connect().await.unwrap();

        assert_eq!(
            next(&mut events).await,
            TransportEvent::Lifecycle(Lifecycle::Connect)
        );
        assert_eq!(
            next(&mut events).await,
            TransportEvent::Lifecycle(Lifecycle::Ready)
        );
        assert_eq!(hub.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_includes_sender() {
        let hub = MemoryHub::new();
        let a = hub.transport();
        let b = hub.transport();
        let mut a_events = a.events();
        let mut b_events = b.events();

        a.connect().await.unwrap();
        b.connect().await.unwrap();

        a.publish(packet("a")).await.unwrap();

        // Skip lifecycle events
        for events in [&mut a_events, &mut b_events] {
            next(events).await;
            next(events).await;
            assert_eq!(next(events).await, TransportEvent::Packet(packet("a")));
        }
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let hub = MemoryHub::new();
        let transport = hub.transport();

        assert!(matches!(
            transport.publish(packet("a")).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let hub = MemoryHub::new();
        let transport = hub.transport();
        let mut events = transport.events();

        transport.connect().await.unwrap();
        transport.disconnect();
        transport.connect().await.unwrap();

        let observed = vec![
            next(&mut events).await,
            next(&mut events).await,
            next(&mut events).await,
            next(&mut events).await,
            next(&mut events).await,
        ];

        assert_eq!(
            observed,
            vec![
                TransportEvent::Lifecycle(Lifecycle::Connect),
                TransportEvent::Lifecycle(Lifecycle::Ready),
                TransportEvent::Lifecycle(Lifecycle::Disconnect),
                TransportEvent::Lifecycle(Lifecycle::Reconnect),
                TransportEvent::Lifecycle(Lifecycle::Ready),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery() {
        let hub = MemoryHub::new();
        let noisy = hub.transport_with_options(MemoryOptions {
            duplicate_delivery: true,
        });
        let mut events = noisy.events();

        noisy.connect().await.unwrap();
        noisy.publish(packet("n")).await.unwrap();

        next(&mut events).await;
        next(&mut events).await;
        assert_eq!(next(&mut events).await, TransportEvent::Packet(packet("n")));
        assert_eq!(next(&mut events).await, TransportEvent::Packet(packet("n")));
    }

    #[tokio::test]
    async fn test_shutdown_prevents_reconnect() {
        let hub = MemoryHub::new();
        let transport = hub.transport();

        transport.connect().await.unwrap();
        transport.shutdown().await.unwrap();

        assert_eq!(hub.connected_count(), 0);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
