//! Membership tracking on top of heartbeats.
//!
//! Every participant periodically republishes its local state. Participants
//! that stay silent for longer than the configured timeout are evicted.

mod worker;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use beacon_realtime::{EventEmitter, ParticipantId, RealtimeClient, WireMessage};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PresenceConfig;
use crate::error::Error;

use worker::Worker;

/// A live member of the group as last observed.
#[derive(Clone, Debug, PartialEq)]
pub struct Participant {
    /// Participant id.
    pub id: ParticipantId,
    /// Last published state.
    pub state: Value,
    /// When the participant was last heard from.
    pub last_seen: Instant,
}

/// Membership events.
#[derive(Clone, Debug, PartialEq)]
pub enum PresenceEvent {
    /// A participant was seen for the first time.
    Join(Participant),
    /// A participant left or was evicted.
    Leave(Participant),
    /// A known participant published different state.
    StateChange(Participant),
    /// The participant set or some participant's state changed.
    Change(Vec<Participant>),
}

pub(crate) type Participants = BTreeMap<ParticipantId, Participant>;

struct Inner {
    client: RealtimeClient,
    local_state: Arc<watch::Sender<Value>>,
    participants: Arc<watch::Sender<Participants>>,
    events: Arc<EventEmitter<PresenceEvent>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Membership tracker.
///
/// Owns the realtime client. Joins the group whenever the transport becomes
/// ready and keeps a live view of every participant.
#[derive(Clone)]
pub struct Presence {
    inner: Arc<Inner>,
}

impl Presence {
    /// Starts tracking membership through `client` with `initial_state`
    /// as the local state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(client: RealtimeClient, config: PresenceConfig, initial_state: Value) -> Self {
        let client_events = client.subscribe();
        let (local_state, state_rx) = watch::channel(initial_state);
        let local_state = Arc::new(local_state);
        let participants = Arc::new(watch::Sender::new(Participants::new()));
        let events = Arc::new(EventEmitter::new());
        let cancel = CancellationToken::new();

        let worker = Worker::new(client.clone(), config, participants.clone(), events.clone());
        let task = tokio::spawn(worker.run(client_events, state_rx, cancel.clone()));

        Self {
            inner: Arc::new(Inner {
                client,
                local_state,
                participants,
                events,
                cancel,
                task: Mutex::new(Some(task)),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// This participant's id.
    #[must_use]
    pub fn id(&self) -> &ParticipantId {
        self.inner.client.id()
    }

    /// The owned realtime client.
    #[must_use]
    pub fn client(&self) -> &RealtimeClient {
        &self.inner.client
    }

    /// Live participants ordered by id, self included once seen.
    #[must_use]
    pub fn participants(&self) -> Vec<Participant> {
        self.inner.participants.borrow().values().cloned().collect()
    }

    /// Looks up one live participant.
    #[must_use]
    pub fn participant(&self, id: &ParticipantId) -> Option<Participant> {
        self.inner.participants.borrow().get(id).cloned()
    }

    /// Current local state.
    #[must_use]
    pub fn local_state(&self) -> Value {
        self.inner.local_state.borrow().clone()
    }

    /// Replaces the local state and heartbeats immediately.
    pub fn set_local_state(&self, state: Value) {
        self.inner.local_state.send_replace(state);
    }

    /// Edits the local state in place and heartbeats immediately.
    pub fn update_local_state<F>(&self, update: F)
    where
        F: FnOnce(&mut Value),
    {
        self.inner.local_state.send_modify(update);
    }

    /// Subscribes to membership events.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<PresenceEvent> {
        self.inner.events.subscribe()
    }

    /// Announces this participant to the group.
    ///
    /// Happens automatically on every transport `Ready`.
    ///
    /// # Errors
    ///
    /// Returns an error if the join cannot be published.
    pub async fn join(&self) -> Result<(), Error> {
        self.inner
            .client
            .send(WireMessage::PresenceJoin(self.local_state()))
            .await?;

        // Heartbeat right away and restart the periodic timer
        self.inner.local_state.send_modify(|_| {});

        Ok(())
    }

    /// Tells the group this participant is leaving.
    ///
    /// # Errors
    ///
    /// Returns an error if the leave cannot be published.
    pub async fn leave(&self) -> Result<(), Error> {
        self.inner
            .client
            .send(WireMessage::PresenceLeave(self.local_state()))
            .await?;

        Ok(())
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Leaves the group and shuts down the owned client.
    ///
    /// Emits `Leave` for every participant still known. Calling this more than
    /// once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the client fails to shut down.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.cancel.cancel();

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("{} presence task failed: {}", self.id(), e);
            }
        }

        if let Err(e) = self.leave().await {
            debug!("{} could not announce leave: {}", self.id(), e);
        }

        let remaining = self.inner.participants.send_replace(Participants::new());
        for participant in remaining.values() {
            self.inner
                .events
                .emit(&PresenceEvent::Leave(participant.clone()));
        }
        if !remaining.is_empty() {
            self.inner.events.emit(&PresenceEvent::Change(Vec::new()));
        }

        self.inner.events.clear();
        self.inner.client.shutdown().await?;

        debug!("{} presence shut down", self.id());

        Ok(())
    }
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Presence")
            .field("id", self.id())
            .field("participants", &self.inner.participants.borrow().len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
