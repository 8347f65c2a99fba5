//! Replication of an indexed event log across the group.
//!
//! The elected leader processes items as they arrive, but only once every
//! participant has reached its cursor. Followers chase the cursor published by
//! the leader, backfilling from storage whatever they missed.

mod follower;
mod leader;

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use beacon_realtime::ParticipantId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReplicationConfig;
use crate::error::Error;
use crate::indexed_queue::{IndexedItem, IndexedQueueTracker, IndexedStorage, QueueIndex, TrackerEvent};
use crate::leader_election::{ElectionState, LeaderElection, LeaderEvent};
use crate::presence::{Participant, PresenceEvent};
use crate::timer::sleep_until;

/// Replication progress published by every participant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCursor {
    /// Index of the last applied item.
    #[serde(default)]
    pub index: Option<QueueIndex>,
}

impl ReplicationCursor {
    /// Reads the cursor carried by an election state.
    #[must_use]
    pub fn of(state: &ElectionState) -> Self {
        Self::from_data(&state.data)
    }

    /// Reads the cursor out of published application data.
    #[must_use]
    pub fn from_data(data: &Value) -> Self {
        serde_json::from_value(data.clone()).unwrap_or_default()
    }

    fn of_participant(participant: &Participant) -> Self {
        Self::of(&ElectionState::of(participant))
    }
}

/// Applies one item of the event log.
#[async_trait]
pub trait QueueItemProcessor: Send + Sync + 'static {
    /// Processing failure.
    type Error: StdError + Send + Sync + 'static;

    /// Applies `item`.
    async fn process(&self, item: &IndexedItem) -> Result<(), Self::Error>;
}

/// Role currently played by this participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// No leadership decision yet.
    Idle,
    /// Processing live items and pacing the group.
    Leader,
    /// Chasing the leader's cursor.
    Follower,
}

pub(crate) struct Context<S, P> {
    election: LeaderElection,
    tracker: IndexedQueueTracker<S>,
    processor: Arc<P>,
    config: ReplicationConfig,
}

impl<S, P> Clone for Context<S, P> {
    fn clone(&self) -> Self {
        Self {
            election: self.election.clone(),
            tracker: self.tracker.clone(),
            processor: self.processor.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: IndexedStorage, P: QueueItemProcessor> Context<S, P> {
    fn id(&self) -> &ParticipantId {
        self.election.presence().id()
    }

    fn cursor(&self) -> Option<QueueIndex> {
        ReplicationCursor::from_data(&self.election.local_state()).index
    }

    /// Publishes `index` as the local cursor, keeping other application data.
    fn publish_cursor(&self, index: &QueueIndex) {
        let mut data = match self.election.local_state() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        data.insert("index".to_string(), Value::String(index.to_string()));

        self.election.set_local_state(Value::Object(data));
    }

    /// Withdraws the local cursor, keeping other application data.
    fn clear_cursor(&self) {
        if let Value::Object(mut data) = self.election.local_state() {
            data.remove("index");
            self.election.set_local_state(Value::Object(data));
        }
    }
}

/// Waits for anything that may let a role make progress.
///
/// Returns `false` once the role must stop.
async fn wait_for_signal(
    presence_events: &flume::Receiver<PresenceEvent>,
    tracker_events: &flume::Receiver<TrackerEvent>,
    cancel: &CancellationToken,
    retry_at: Option<Instant>,
) -> bool {
    let proceed = tokio::select! {
        () = cancel.cancelled() => false,
        event = presence_events.recv_async() => event.is_ok(),
        event = tracker_events.recv_async() => event.is_ok(),
        () = sleep_until(retry_at) => true,
    };

    // Coalesce bursts into one pass
    presence_events.drain();
    tracker_events.drain();

    proceed
}

struct RoleTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RoleTask {
    fn start<S: IndexedStorage, P: QueueItemProcessor>(
        context: &Context<S, P>,
        role: Role,
        parent: &CancellationToken,
    ) -> Option<Self> {
        let cancel = parent.child_token();
        let presence_events = context.election.presence().subscribe();
        let tracker_events = context.tracker.subscribe();
        let context = context.clone();

        let handle = match role {
            Role::Leader => tokio::spawn(leader::run(
                context,
                presence_events,
                tracker_events,
                cancel.clone(),
            )),
            Role::Follower => tokio::spawn(follower::run(
                context,
                presence_events,
                tracker_events,
                cancel.clone(),
            )),
            Role::Idle => return None,
        };

        Some(Self { cancel, handle })
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Replication role task failed: {}", e);
        }
    }
}

struct Inner<S, P> {
    context: Context<S, P>,
    role: watch::Receiver<Role>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Replication coordinator.
///
/// Owns the leader election and the tracker. Switches between the leader and
/// follower roles whenever leadership changes.
pub struct ReplicationCoordinator<S, P> {
    inner: Arc<Inner<S, P>>,
}

impl<S, P> Clone for ReplicationCoordinator<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: IndexedStorage, P: QueueItemProcessor> ReplicationCoordinator<S, P> {
    /// Starts replicating items from `tracker` through `processor`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        election: LeaderElection,
        tracker: IndexedQueueTracker<S>,
        processor: P,
        config: ReplicationConfig,
    ) -> Self {
        let context = Context {
            election,
            tracker,
            processor: Arc::new(processor),
            config,
        };
        let leader_events = context.election.subscribe();
        let (role_tx, role) = watch::channel(Role::Idle);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(supervise(
            context.clone(),
            leader_events,
            role_tx,
            cancel.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                context,
                role,
                cancel,
                task: Mutex::new(Some(task)),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// The owned leader election.
    #[must_use]
    pub fn election(&self) -> &LeaderElection {
        &self.inner.context.election
    }

    /// The owned tracker.
    #[must_use]
    pub fn tracker(&self) -> &IndexedQueueTracker<S> {
        &self.inner.context.tracker
    }

    /// Role currently played.
    #[must_use]
    pub fn role(&self) -> Role {
        *self.inner.role.borrow()
    }

    /// Index of the last item applied here.
    #[must_use]
    pub fn cursor(&self) -> Option<QueueIndex> {
        self.inner.context.cursor()
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stops the current role and shuts down the election and the tracker.
    ///
    /// Calling this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the owned components.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.cancel.cancel();

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("{} replication task failed: {}", self.inner.context.id(), e);
            }
        }

        let election = self.inner.context.election.shutdown().await;
        let tracker = self.inner.context.tracker.shutdown().await;

        debug!("{} replication shut down", self.inner.context.id());

        election.and(tracker)
    }
}

impl<S, P> fmt::Debug for ReplicationCoordinator<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("role", &*self.inner.role.borrow())
            .finish_non_exhaustive()
    }
}

async fn supervise<S: IndexedStorage, P: QueueItemProcessor>(
    context: Context<S, P>,
    leader_events: flume::Receiver<LeaderEvent>,
    role_tx: watch::Sender<Role>,
    cancel: CancellationToken,
) {
    let mut current: Option<RoleTask> = None;

    // Leadership may have settled before we subscribed
    if context.election.has_leader() {
        let role = if context.election.is_leader() {
            Role::Leader
        } else {
            Role::Follower
        };
        current = RoleTask::start(&context, role, &cancel);
        role_tx.send_replace(role);
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = leader_events.recv_async() => match event {
                Ok(LeaderEvent::LeadershipStateChanged { is_leader }) => {
                    let role = if is_leader { Role::Leader } else { Role::Follower };
                    if *role_tx.borrow() != role {
                        if let Some(task) = current.take() {
                            task.stop().await;
                        }

                        info!("{} switching to {:?}", context.id(), role);

                        current = RoleTask::start(&context, role, &cancel);
                        role_tx.send_replace(role);
                    }
                }
                Ok(LeaderEvent::LeaderRequested) => {}
                Err(_) => break,
            },
        }
    }

    if let Some(task) = current.take() {
        task.stop().await;
    }
    role_tx.send_replace(Role::Idle);
}
