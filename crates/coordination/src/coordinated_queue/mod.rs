//! Leader-driven broadcast queue with an acknowledgement barrier.
//!
//! Items are processed one at a time. For every popped item the leader mints
//! an ack token and broadcasts the item; every participant surfaces it as a
//! [`CoordinatedMessage`] and acknowledges it. The next item is only popped
//! once every participant that was live when the round started has either
//! acknowledged or left.

mod worker;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use beacon_realtime::{CoordinatedAck, EventEmitter, ParticipantId, RealtimeClient, WireMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::leader_election::LeaderElection;

use worker::{Command, Worker};

/// One entry of the coordinated queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    /// Milliseconds since the Unix epoch at enqueue time.
    pub timestamp: u64,
    /// Unique item id.
    pub nonce: String,
    /// Application payload.
    pub data: Value,
}

impl QueuedItem {
    /// Stamps `data` with the current time and a fresh nonce.
    #[must_use]
    pub fn new(data: Value) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));

        Self {
            timestamp,
            nonce: Uuid::new_v4().to_string(),
            data,
        }
    }
}

/// A broadcast item waiting for this participant's acknowledgement.
#[derive(Clone, Debug)]
pub struct CoordinatedMessage {
    /// Wire event the item arrived with.
    pub event: &'static str,
    /// The leader that broadcast the item.
    pub src: ParticipantId,
    /// Token of the ack round.
    pub ack_token: String,
    /// The broadcast [`QueuedItem`] as JSON.
    pub data: Value,
    client: RealtimeClient,
}

impl CoordinatedMessage {
    /// Decodes the broadcast item.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a queued item.
    pub fn item(&self) -> Result<QueuedItem, Error> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Acknowledges the item to the whole group.
    ///
    /// # Errors
    ///
    /// Returns an error if the ack cannot be published.
    pub async fn ack(&self) -> Result<(), Error> {
        self.client
            .send(WireMessage::CoordinatedAck(CoordinatedAck {
                ack: self.ack_token.clone(),
                member: self.client.id().clone(),
            }))
            .await?;

        Ok(())
    }
}

struct Inner {
    election: LeaderElection,
    commands: flume::Sender<Command>,
    events: Arc<EventEmitter<CoordinatedMessage>>,
    queued: Arc<AtomicUsize>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Coordinated broadcast queue.
///
/// Owns the leader election.
#[derive(Clone)]
pub struct CoordinatedQueue {
    inner: Arc<Inner>,
}

impl CoordinatedQueue {
    /// Starts the queue on top of `election`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(election: LeaderElection) -> Self {
        let (commands, command_rx) = flume::unbounded();
        let client_events = election.presence().client().subscribe();
        let presence_events = election.presence().subscribe();
        let leader_events = election.subscribe();
        let events = Arc::new(EventEmitter::new());
        let queued = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let worker = Worker::new(election.clone(), commands.clone(), events.clone(), queued.clone());
        let task = tokio::spawn(worker.run(
            command_rx,
            client_events,
            presence_events,
            leader_events,
            cancel.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                election,
                commands,
                events,
                queued,
                cancel,
                task: Mutex::new(Some(task)),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// The owned leader election.
    #[must_use]
    pub fn election(&self) -> &LeaderElection {
        &self.inner.election
    }

    /// Enqueues `data` as a freshly stamped item.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is shut down.
    pub fn enqueue(&self, data: Value) -> Result<QueuedItem, Error> {
        let item = QueuedItem::new(data);
        self.enqueue_item(item.clone())?;
        Ok(item)
    }

    /// Enqueues a pre-built item.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is shut down.
    pub fn enqueue_item(&self, item: QueuedItem) -> Result<(), Error> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }

        self.inner
            .commands
            .send(Command::Enqueue(item))
            .map_err(|_| Error::ShutDown)
    }

    /// Number of items waiting locally, the one in flight excluded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Whether no items are waiting locally.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to broadcast items.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<CoordinatedMessage> {
        self.inner.events.subscribe()
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Drops every queued item and shuts down the owned election.
    ///
    /// Calling this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the election fails to shut down.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.cancel.cancel();

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("{} queue task failed: {}", self.id(), e);
            }
        }

        self.inner.queued.store(0, Ordering::SeqCst);
        self.inner.events.clear();
        self.inner.election.shutdown().await?;

        debug!("{} coordinated queue shut down", self.id());

        Ok(())
    }

    fn id(&self) -> &ParticipantId {
        self.inner.election.presence().id()
    }
}

impl fmt::Debug for CoordinatedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatedQueue")
            .field("id", self.id())
            .field("queued", &self.len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use beacon_realtime_memory::MemoryHub;
    use serde_json::json;
    use tokio::time::timeout;

    use crate::config::{LeaderElectionConfig, PresenceConfig};
    use crate::presence::Presence;

    fn start(hub: &MemoryHub, id: &str) -> CoordinatedQueue {
        let client = RealtimeClient::with_id(hub.transport(), ParticipantId::from(id));
        let presence = Presence::new(client, PresenceConfig::default(), Value::Null);
        let election = LeaderElection::new(
            presence,
            LeaderElectionConfig {
                warmup: Duration::from_secs(1),
                ..LeaderElectionConfig::default()
            },
        );
        CoordinatedQueue::new(election)
    }

    #[test]
    fn test_queued_item_is_stamped() {
        let a = QueuedItem::new(json!({ "op": "add" }));
        let b = QueuedItem::new(json!({ "op": "add" }));

        assert_ne!(a.nonce, b.nonce);
        assert!(a.timestamp > 0);
        assert_eq!(
            serde_json::to_value(&a).unwrap()["data"],
            json!({ "op": "add" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_leader_processes_in_order() {
        let _ = tracing_subscriber::fmt::try_init();

        let hub = MemoryHub::new();
        let queue = start(&hub, "solo");
        let messages = queue.subscribe();
        queue.election().presence().client().connect().await.unwrap();

        for n in 1..=3 {
            queue.enqueue(json!({ "n": n })).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let message = timeout(Duration::from_secs(30), messages.recv_async())
                .await
                .expect("timed out")
                .expect("closed");
            assert_eq!(message.src.as_str(), "solo");
            seen.push(message.item().unwrap().data["n"].clone());
            message.ack().await.unwrap();
        }

        assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_item_blocks_the_next() {
        let hub = MemoryHub::new();
        let queue = start(&hub, "solo");
        let messages = queue.subscribe();
        queue.election().presence().client().connect().await.unwrap();

        queue.enqueue(json!(1)).unwrap();
        queue.enqueue(json!(2)).unwrap();

        let first = timeout(Duration::from_secs(30), messages.recv_async())
            .await
            .expect("timed out")
            .expect("closed");
        assert_eq!(first.item().unwrap().data, json!(1));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(messages.is_empty());
        assert_eq!(queue.len(), 1);

        first.ack().await.unwrap();

        let second = timeout(Duration::from_secs(30), messages.recv_async())
            .await
            .expect("timed out")
            .expect("closed");
        assert_eq!(second.item().unwrap().data, json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_enqueue() {
        let hub = MemoryHub::new();
        let queue = start(&hub, "solo");

        queue.shutdown().await.unwrap();
        queue.shutdown().await.unwrap();

        assert!(matches!(queue.enqueue(json!(1)), Err(Error::ShutDown)));
        assert!(queue.election().is_shut_down());
        assert!(queue.election().presence().client().is_shut_down());
    }
}
