//! Leader election over presence.
//!
//! Leadership is claimed with `leader:announced` and every announcement is
//! trusted. Each participant publishes whether it believes it leads, so late
//! joiners and participants that missed an announcement can still tell that a
//! leader exists.

mod comparator;
mod worker;

pub use comparator::{ParticipantComparator, by_cursor_then_id, by_id};
pub(crate) use comparator::rank;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use beacon_realtime::{EventEmitter, ParticipantId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LeaderElectionConfig;
use crate::error::Error;
use crate::presence::{Participant, Presence};

use worker::Worker;

/// State published through presence by every election participant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionState {
    /// Whether the participant believes it is the leader.
    #[serde(default)]
    pub is_leader: bool,
    /// Application state.
    #[serde(default)]
    pub data: Value,
}

impl ElectionState {
    /// Reads a participant's published election state.
    ///
    /// Anything that does not look like an election state reads as a
    /// non-leader without data.
    #[must_use]
    pub fn of(participant: &Participant) -> Self {
        Self::from_value(&participant.state)
    }

    pub(crate) fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub(crate) fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Leader election events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderEvent {
    /// This participant asked the group for a leader.
    LeaderRequested,
    /// This participant gained or lost leadership.
    LeadershipStateChanged {
        /// Whether this participant now leads.
        is_leader: bool,
    },
}

struct Inner {
    presence: Presence,
    leader: watch::Receiver<Option<ParticipantId>>,
    events: Arc<EventEmitter<LeaderEvent>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Leader election coordinator.
///
/// Owns the presence tracker and from then on the presence local state, which
/// becomes an [`ElectionState`] wrapping the application data.
#[derive(Clone)]
pub struct LeaderElection {
    inner: Arc<Inner>,
}

impl LeaderElection {
    /// Starts electing with the default comparator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(presence: Presence, config: LeaderElectionConfig) -> Self {
        Self::with_comparator(presence, config, by_id())
    }

    /// Starts electing with `comparator` ranking the candidates.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_comparator(
        presence: Presence,
        config: LeaderElectionConfig,
        comparator: ParticipantComparator,
    ) -> Self {
        presence.update_local_state(|state| {
            let data = std::mem::take(state);
            *state = ElectionState {
                is_leader: false,
                data,
            }
            .to_value();
        });

        let client_events = presence.client().subscribe();
        let presence_events = presence.subscribe();
        let (leader_tx, leader) = watch::channel(None);
        let events = Arc::new(EventEmitter::new());
        let cancel = CancellationToken::new();

        let worker = Worker::new(presence.clone(), config, comparator, leader_tx, events.clone());
        let task = tokio::spawn(worker.run(client_events, presence_events, cancel.clone()));

        Self {
            inner: Arc::new(Inner {
                presence,
                leader,
                events,
                cancel,
                task: Mutex::new(Some(task)),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// The owned presence tracker.
    #[must_use]
    pub fn presence(&self) -> &Presence {
        &self.inner.presence
    }

    /// The participant currently believed to lead.
    #[must_use]
    pub fn leader(&self) -> Option<ParticipantId> {
        self.inner.leader.borrow().clone()
    }

    /// Whether some leader is currently known.
    #[must_use]
    pub fn has_leader(&self) -> bool {
        self.inner.leader.borrow().is_some()
    }

    /// Whether this participant is the believed leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.inner.leader.borrow().as_ref() == Some(self.inner.presence.id())
    }

    /// Application data currently published by this participant.
    #[must_use]
    pub fn local_state(&self) -> Value {
        ElectionState::from_value(&self.inner.presence.local_state()).data
    }

    /// Replaces the published application data, keeping the leader flag.
    pub fn set_local_state(&self, data: Value) {
        self.inner.presence.update_local_state(|state| {
            let mut election = ElectionState::from_value(state);
            election.data = data;
            *state = election.to_value();
        });
    }

    /// Subscribes to election events.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<LeaderEvent> {
        self.inner.events.subscribe()
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stops electing and shuts down the owned presence tracker.
    ///
    /// Calling this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if presence fails to shut down.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let was_leader = self.is_leader();

        self.inner.cancel.cancel();

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("{} election task failed: {}", self.presence().id(), e);
            }
        }

        if was_leader {
            self.inner
                .events
                .emit(&LeaderEvent::LeadershipStateChanged { is_leader: false });
        }

        self.inner.events.clear();
        self.inner.presence.shutdown().await?;

        debug!("{} leader election shut down", self.presence().id());

        Ok(())
    }
}

impl fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderElection")
            .field("id", self.presence().id())
            .field("leader", &self.leader())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
