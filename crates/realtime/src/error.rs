use thiserror::Error;

/// Errors reported by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Transport is not connected
    #[error("transport not connected")]
    NotConnected,

    /// Packet could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Errors that occur while decoding a packet into a wire message.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The event name is not part of the protocol.
    #[error("unknown event `{0}`")]
    UnknownEvent(String),

    /// The payload does not match the event's schema.
    #[error("invalid payload for `{event}`: {source}")]
    Payload {
        /// Event name.
        event: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// Errors raised by the realtime client.
#[derive(Debug, Error)]
pub enum Error {
    /// Outbound message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// Client has been shut down.
    #[error("client is shut down")]
    ShutDown,

    /// Underlying transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
