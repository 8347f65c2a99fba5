use thiserror::Error;

/// Errors that can occur while configuring the WebSocket transport.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The endpoint URL does not use `ws` or `wss`.
    #[error("unsupported url scheme `{0}` - expected ws or wss")]
    UnsupportedScheme(String),
}
