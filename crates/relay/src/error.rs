use thiserror::Error;

/// Errors that can occur while running the relay.
#[derive(Debug, Error)]
pub enum Error {
    /// Binding or serving failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
