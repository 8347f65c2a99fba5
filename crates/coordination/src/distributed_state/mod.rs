//! Group-wide agreement on a timestamped state.
//!
//! After a warm-up every participant adopts the most recent state published in
//! the group and then watches whether everybody publishes an equivalent one.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use beacon_realtime::EventEmitter;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DistributedStateConfig;
use crate::error::Error;
use crate::leader_election::ParticipantComparator;
use crate::presence::{Presence, PresenceEvent};
use crate::timer::sleep_until;

/// Synchronisation events.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// Every participant now publishes an equivalent state.
    Sync,
    /// Some participant diverged.
    Desync,
    /// Nobody holds a timestamped state; the payload is the best candidate
    /// found, or an empty object.
    EmptyState(Value),
}

/// Orders states by their numeric `timestamp` field, missing timestamps first.
#[must_use]
pub fn by_timestamp() -> ParticipantComparator {
    Arc::new(|a, b| {
        let timestamp = |state: &Value| state.get("timestamp").and_then(Value::as_f64);

        match (timestamp(&a.state), timestamp(&b.state)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal),
            (left, right) => left.is_some().cmp(&right.is_some()),
        }
    })
}

struct Inner {
    presence: Presence,
    synchronized: Arc<AtomicBool>,
    events: Arc<EventEmitter<SyncEvent>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Distributed state tracker.
///
/// Owns the presence tracker and its local state.
#[derive(Clone)]
pub struct DistributedState {
    inner: Arc<Inner>,
}

impl DistributedState {
    /// Starts tracking with [`by_timestamp`] ordering states.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(presence: Presence, config: DistributedStateConfig) -> Self {
        Self::with_comparator(presence, config, by_timestamp())
    }

    /// Starts tracking with `comparator` ordering states, most recent last.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_comparator(
        presence: Presence,
        config: DistributedStateConfig,
        comparator: ParticipantComparator,
    ) -> Self {
        let synchronized = Arc::new(AtomicBool::new(false));
        let events = Arc::new(EventEmitter::new());
        let cancel = CancellationToken::new();

        let worker = Worker {
            presence: presence.clone(),
            config,
            comparator,
            synchronized: synchronized.clone(),
            events: events.clone(),
            warmup_at: None,
        };
        let task = tokio::spawn(worker.run(presence.subscribe(), cancel.clone()));

        Self {
            inner: Arc::new(Inner {
                presence,
                synchronized,
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

    /// Whether every participant published an equivalent state last time
    /// it was checked.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.inner.synchronized.load(Ordering::SeqCst)
    }

    /// Publishes a new local state.
    pub fn set_state(&self, state: Value) {
        self.inner.presence.set_local_state(state);
    }

    /// Subscribes to synchronisation events.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stops tracking and shuts down the owned presence tracker.
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

        self.inner.cancel.cancel();

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("{} distributed state task failed: {}", self.presence().id(), e);
            }
        }

        self.inner.events.clear();
        self.inner.presence.shutdown().await
    }
}

impl fmt::Debug for DistributedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedState")
            .field("id", self.presence().id())
            .field("synchronized", &self.is_synchronized())
            .finish_non_exhaustive()
    }
}

struct Worker {
    presence: Presence,
    config: DistributedStateConfig,
    comparator: ParticipantComparator,
    synchronized: Arc<AtomicBool>,
    events: Arc<EventEmitter<SyncEvent>>,
    warmup_at: Option<Instant>,
}

impl Worker {
    async fn run(mut self, presence_events: flume::Receiver<PresenceEvent>, cancel: CancellationToken) {
        self.warmup_at = Some(Instant::now() + self.config.warmup);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = presence_events.recv_async() => match event {
                    Ok(PresenceEvent::Change(_) | PresenceEvent::StateChange(_)) => {
                        if self.warmup_at.is_none() {
                            self.evaluate();
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                },
                () = sleep_until(self.warmup_at) => {
                    self.warmup_at = None;
                    self.adopt_most_recent();
                }
            }
        }

        debug!("{} distributed state loop stopped", self.presence.id());
    }

    fn adopt_most_recent(&mut self) {
        let mut members = self.presence.participants();
        members.sort_by(|a, b| (self.comparator)(a, b));

        let recent = members.pop().map(|p| p.state);
        let timestamped = recent
            .as_ref()
            .and_then(|state| state.get("timestamp"))
            .is_some_and(|timestamp| !timestamp.is_null());

        match recent {
            Some(state) if timestamped => {
                info!("{} adopting most recent group state", self.presence.id());
                self.presence.set_local_state(state);
                self.evaluate();
            }
            recent => {
                debug!("{} found no timestamped state", self.presence.id());
                self.events
                    .emit(&SyncEvent::EmptyState(recent.unwrap_or_else(|| json!({}))));
                self.warmup_at = Some(Instant::now() + self.config.warmup);
            }
        }
    }

    fn evaluate(&self) {
        let participants = self.presence.participants();

        let in_sync = participants.first().is_none_or(|first| {
            participants
                .iter()
                .all(|p| (self.comparator)(first, p) == CmpOrdering::Equal)
        });

        let was_in_sync = self.synchronized.swap(in_sync, Ordering::SeqCst);

        if in_sync && !was_in_sync {
            info!("{} state synchronized", self.presence.id());
            self.events.emit(&SyncEvent::Sync);
        } else if !in_sync && was_in_sync {
            info!("{} state diverged", self.presence.id());
            self.events.emit(&SyncEvent::Desync);
        }
    }
}
