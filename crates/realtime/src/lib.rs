//! Generic realtime transport abstraction for participant coordination.
//!
//! A realtime transport is an unordered, at-least-once, fan-out publish/subscribe
//! medium. Specific transports (in-memory, WebSocket) are provided in separate crates.
//!
//! Transports handle:
//! - Connection lifecycle (`connect`, `reconnect`, `ready`, `disconnect`)
//! - Fan-out delivery of opaque packets to every connected participant, sender included
//!
//! The [`RealtimeClient`] sits on top of a transport and handles:
//! - Participant identity and loopback detection
//! - Decoding packets into typed [`WireMessage`]s
//! - Fan-out of decoded events to every local subscriber
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod emitter;
mod error;
mod wire;

pub use client::{ClientEvent, Inbound, RealtimeClient};
pub use emitter::EventEmitter;
pub use error::{DecodeError, Error, TransportError};
pub use wire::{CoordinatedAck, CoordinatedMsg, CoordinatedWelcome, WireMessage, event_names};

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque, unique identifier of a participant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Generates a fresh random participant id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Connection lifecycle events reported by a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// First successful connection.
    Connect,
    /// Connection re-established after a disconnect.
    Reconnect,
    /// Transport is ready to carry packets.
    Ready,
    /// Connection lost or closed.
    Disconnect,
}

/// Transport-level packet as carried on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Sender of the packet.
    pub src: ParticipantId,
    /// Wire event name.
    pub event: String,
    /// Opaque event payload.
    #[serde(default)]
    pub data: Value,
}

/// Anything a transport can report to its consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Lifecycle change.
    Lifecycle(Lifecycle),
    /// Inbound packet (including packets sent by this transport).
    Packet(Packet),
}

/// Stream of transport events.
pub type TransportEventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Transport trait for publishing and receiving packets
///
/// Delivery guarantees are deliberately weak:
/// - at-least-once (duplicates are possible)
/// - no ordering between senders
/// - fan-out to every connected participant, the sender included
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start connecting. Progress is reported through lifecycle events.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Publish a packet to every connected participant.
    async fn publish(&self, packet: Packet) -> Result<(), TransportError>;

    /// Get the stream of incoming transport events.
    ///
    /// All streams returned by one transport share the same underlying queue,
    /// so a transport is expected to have a single consumer.
    fn events(&self) -> TransportEventStream;

    /// Shutdown the transport.
    async fn shutdown(&self) -> Result<(), TransportError>;
}
