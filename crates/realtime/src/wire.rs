use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::DecodeError;
use crate::{Packet, ParticipantId};

/// Wire event names.
pub mod event_names {
    /// Participant announces itself.
    pub const PRESENCE_JOIN: &str = "presence:join";
    /// Periodic liveness + state republication.
    pub const PRESENCE_HEARTBEAT: &str = "presence:heartbeat";
    /// Participant leaves the group.
    pub const PRESENCE_LEAVE: &str = "presence:leave";
    /// Someone asks the group to (re-)establish a leader.
    pub const LEADER_REQUESTED: &str = "leader:requested";
    /// A participant claims leadership.
    pub const LEADER_ANNOUNCED: &str = "leader:announced";
    /// Leader broadcasts a queue item to be acknowledged.
    pub const COORDINATED_MSG: &str = "coordinated:msg";
    /// Participant acknowledges a queue item.
    pub const COORDINATED_ACK: &str = "coordinated:ack";
    /// Leader welcomes a newcomer with the head of its queue.
    pub const COORDINATED_WELCOME: &str = "coordinated:welcome";
    /// One item of the external indexed event log.
    pub const QUEUE_ITEM: &str = "queue:item";
}

/// Payload of `coordinated:msg`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinatedMsg {
    /// Ack token of the round.
    pub ack: String,
    /// Queue item being broadcast.
    pub data: Value,
}

/// Payload of `coordinated:ack`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatedAck {
    /// Ack token being acknowledged.
    pub ack: String,
    /// Acknowledging participant.
    pub member: ParticipantId,
}

/// Payload of `coordinated:welcome`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatedWelcome {
    /// Head of the leader's local queue, if any.
    pub next_queue_item: Option<Value>,
}

/// Closed set of protocol messages, one variant per wire event name.
#[derive(Clone, Debug, PartialEq)]
pub enum WireMessage {
    /// `presence:join` carrying the sender's local state.
    PresenceJoin(Value),
    /// `presence:heartbeat` carrying the sender's local state.
    PresenceHeartbeat(Value),
    /// `presence:leave` carrying the sender's last local state.
    PresenceLeave(Value),
    /// `leader:requested` carrying the requester's published state.
    LeaderRequested(Value),
    /// `leader:announced` carrying the announcer's published state.
    LeaderAnnounced(Value),
    /// `coordinated:msg`.
    CoordinatedMsg(CoordinatedMsg),
    /// `coordinated:ack`.
    CoordinatedAck(CoordinatedAck),
    /// `coordinated:welcome`.
    CoordinatedWelcome(CoordinatedWelcome),
    /// `queue:item` carrying one indexed event.
    QueueItem(Value),
}

impl WireMessage {
    /// Wire event name of this message.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::PresenceJoin(_) => event_names::PRESENCE_JOIN,
            Self::PresenceHeartbeat(_) => event_names::PRESENCE_HEARTBEAT,
            Self::PresenceLeave(_) => event_names::PRESENCE_LEAVE,
            Self::LeaderRequested(_) => event_names::LEADER_REQUESTED,
            Self::LeaderAnnounced(_) => event_names::LEADER_ANNOUNCED,
            Self::CoordinatedMsg(_) => event_names::COORDINATED_MSG,
            Self::CoordinatedAck(_) => event_names::COORDINATED_ACK,
            Self::CoordinatedWelcome(_) => event_names::COORDINATED_WELCOME,
            Self::QueueItem(_) => event_names::QUEUE_ITEM,
        }
    }

    /// Encodes the message into a packet sent by `src`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn into_packet(self, src: ParticipantId) -> Result<Packet, serde_json::Error> {
        let event = self.event_name().to_string();

        let data = match self {
            Self::PresenceJoin(value)
            | Self::PresenceHeartbeat(value)
            | Self::PresenceLeave(value)
            | Self::LeaderRequested(value)
            | Self::LeaderAnnounced(value)
            | Self::QueueItem(value) => value,
            Self::CoordinatedMsg(msg) => serde_json::to_value(msg)?,
            Self::CoordinatedAck(ack) => serde_json::to_value(ack)?,
            Self::CoordinatedWelcome(welcome) => serde_json::to_value(welcome)?,
        };

        Ok(Packet { src, event, data })
    }

    /// Decodes a packet received from the transport.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown event names or payloads not matching the
    /// event's schema.
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        let data = packet.data.clone();

        let message = match packet.event.as_str() {
            event_names::PRESENCE_JOIN => Self::PresenceJoin(data),
            event_names::PRESENCE_HEARTBEAT => Self::PresenceHeartbeat(data),
            event_names::PRESENCE_LEAVE => Self::PresenceLeave(data),
            event_names::LEADER_REQUESTED => Self::LeaderRequested(data),
            event_names::LEADER_ANNOUNCED => Self::LeaderAnnounced(data),
            event_names::COORDINATED_MSG => Self::CoordinatedMsg(payload(packet, data)?),
            event_names::COORDINATED_ACK => Self::CoordinatedAck(payload(packet, data)?),
            event_names::COORDINATED_WELCOME => Self::CoordinatedWelcome(payload(packet, data)?),
            event_names::QUEUE_ITEM => Self::QueueItem(data),
            other => return Err(DecodeError::UnknownEvent(other.to_string())),
        };

        Ok(message)
    }
}

fn payload<T: DeserializeOwned>(packet: &Packet, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::Payload {
        event: packet.event.clone(),
        source,
    })
}
