//! Realtime coordination primitives built on a weak pub/sub transport.
//!
//! Components stack on top of each other, each owning the one below:
//! - [`Presence`] tracks who is in the group through heartbeats
//! - [`LeaderElection`] agrees on a single leader
//! - [`CoordinatedQueue`] broadcasts items one at a time behind an ack barrier
//! - [`ReplicationCoordinator`] replicates an indexed event log, pacing the
//!   leader by its slowest follower
//! - [`DistributedState`] converges the group on the most recent state
//!
//! Every component runs as a single task fed by its subscriptions and timers.
//! Handles are cheap to clone and shutting down a component also shuts down
//! what it owns.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod timer;

pub mod coordinated_queue;
pub mod distributed_state;
pub mod indexed_queue;
pub mod leader_election;
pub mod presence;
pub mod replication;

pub use config::{
    DistributedStateConfig, IndexedQueueConfig, LeaderElectionConfig, PresenceConfig,
    ReplicationConfig,
};
pub use coordinated_queue::{CoordinatedMessage, CoordinatedQueue, QueuedItem};
pub use distributed_state::{DistributedState, SyncEvent};
pub use error::{Error, TrackerError};
pub use indexed_queue::{
    IndexFormatter, IndexedItem, IndexedQueueTracker, IndexedStorage, MemoryStorage, QueueIndex,
    TrackerEvent, field_index,
};
pub use leader_election::{ElectionState, LeaderElection, LeaderEvent, ParticipantComparator};
pub use presence::{Participant, Presence, PresenceEvent};
pub use replication::{QueueItemProcessor, ReplicationCoordinator, ReplicationCursor, Role};
