use std::error::Error as StdError;

use thiserror::Error;

/// Errors surfaced by the coordination components.
#[derive(Debug, Error)]
pub enum Error {
    /// The component has been shut down.
    #[error("component is shut down")]
    ShutDown,

    /// Realtime client failure.
    #[error(transparent)]
    Realtime(#[from] beacon_realtime::Error),

    /// A payload did not have the expected shape.
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Indexed queue tracker failure.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Errors surfaced by the indexed queue tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The backing store failed while filling a gap.
    #[error("backfill failed: {0}")]
    Backfill(#[source] Box<dyn StdError + Send + Sync>),

    /// The tracker has been shut down.
    #[error("tracker is shut down")]
    ShutDown,
}
