//! Bounded window over an externally indexed event log.
//!
//! Items arrive live as `queue:item` messages and are kept in index order.
//! Consumers that fall behind the window backfill the missing history from an
//! [`IndexedStorage`].

mod storage;

pub use storage::{IndexedStorage, MemoryStorage};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use beacon_realtime::{ClientEvent, EventEmitter, Inbound, RealtimeClient, WireMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::IndexedQueueConfig;
use crate::error::{Error, TrackerError};

/// Position of an item in the external event log.
///
/// Indexes compare lexicographically, so producers must format them with a
/// fixed width (for example zero padded).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueIndex(String);

impl QueueIndex {
    /// Wraps an already formatted index.
    pub fn new(index: impl Into<String>) -> Self {
        Self(index.into())
    }

    /// String form of the index.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueIndex {
    fn from(index: &str) -> Self {
        Self::new(index)
    }
}

/// An event together with its index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedItem {
    /// Index of the event.
    pub index: QueueIndex,
    /// The event as received.
    pub data: Value,
}

/// Derives the index of an event.
pub type IndexFormatter = Arc<dyn Fn(&Value) -> Option<QueueIndex> + Send + Sync>;

/// Reads the index from a top-level string field of the event.
#[must_use]
pub fn field_index(field: &'static str) -> IndexFormatter {
    Arc::new(move |value| value.get(field)?.as_str().map(QueueIndex::new))
}

/// Tracker events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerEvent {
    /// A live item entered the window.
    Appended(QueueIndex),
}

struct WindowState {
    items: VecDeque<IndexedItem>,
    /// Index of the last item that left the window through the head.
    last_removed: Option<QueueIndex>,
}

impl WindowState {
    fn pop_front(&mut self) -> Option<IndexedItem> {
        let item = self.items.pop_front()?;
        self.last_removed = Some(item.index.clone());
        Some(item)
    }

    fn drop_through(&mut self, index: &QueueIndex) {
        while self.items.front().is_some_and(|item| item.index <= *index) {
            self.pop_front();
        }
    }
}

struct Window {
    format: IndexFormatter,
    max_window: usize,
    state: Mutex<WindowState>,
    events: EventEmitter<TrackerEvent>,
}

impl Window {
    fn index(&self, value: Value) -> Option<IndexedItem> {
        match (self.format)(&value) {
            Some(index) => Some(IndexedItem { index, data: value }),
            None => {
                warn!("Dropping queue item without index: {}", value);
                None
            }
        }
    }

    /// Inserts a live item in index order, trimming the head to capacity.
    fn append(&self, value: Value) -> Option<QueueIndex> {
        let item = self.index(value)?;
        let index = item.index.clone();

        {
            let mut state = self.state.lock();

            if state.last_removed.as_ref().is_some_and(|last| index <= *last) {
                trace!("Ignoring stale queue item {}", index);
                return None;
            }

            if state.items.back().is_none_or(|tail| tail.index < index) {
                state.items.push_back(item);
            } else {
                match state.items.binary_search_by(|probe| probe.index.cmp(&index)) {
                    Ok(_) => {
                        trace!("Ignoring duplicate queue item {}", index);
                        return None;
                    }
                    Err(position) => state.items.insert(position, item),
                }
            }

            while state.items.len() > self.max_window {
                state.pop_front();
            }
        }

        self.events.emit(&TrackerEvent::Appended(index.clone()));

        Some(index)
    }

    /// Prepends backfilled history older than the head, trimming the tail to
    /// capacity.
    fn merge_backfill(&self, values: Vec<Value>) {
        let mut backfill = values
            .into_iter()
            .filter_map(|value| self.index(value))
            .collect::<Vec<_>>();
        backfill.sort_by(|a, b| a.index.cmp(&b.index));

        let mut state = self.state.lock();

        for item in backfill.into_iter().rev() {
            if state
                .items
                .front()
                .is_none_or(|head| item.index < head.index)
            {
                state.items.push_front(item);
            }
        }

        state.items.truncate(self.max_window);
    }
}

struct Inner<S> {
    client: RealtimeClient,
    storage: S,
    window: Arc<Window>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Tracks the live tail of an indexed event log.
///
/// Owns the realtime client it listens on.
pub struct IndexedQueueTracker<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for IndexedQueueTracker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: IndexedStorage> IndexedQueueTracker<S> {
    /// Starts tracking `queue:item` messages received through `client`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        client: RealtimeClient,
        storage: S,
        config: IndexedQueueConfig,
        format: IndexFormatter,
    ) -> Self {
        let window = Arc::new(Window {
            format,
            max_window: config.max_window,
            state: Mutex::new(WindowState {
                items: VecDeque::new(),
                last_removed: None,
            }),
            events: EventEmitter::new(),
        });
        let cancel = CancellationToken::new();

        let task = tokio::spawn(listen(client.subscribe(), window.clone(), cancel.clone()));

        Self {
            inner: Arc::new(Inner {
                client,
                storage,
                window,
                cancel,
                task: Mutex::new(Some(task)),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// The owned realtime client.
    #[must_use]
    pub fn client(&self) -> &RealtimeClient {
        &self.inner.client
    }

    /// The backing store.
    #[must_use]
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// Adds an item to the local window as if it had arrived live.
    ///
    /// Returns the item's index, or `None` when it has no index, is already in
    /// the window or is older than what was already consumed.
    pub fn push(&self, value: Value) -> Option<QueueIndex> {
        self.inner.window.append(value)
    }

    /// Publishes an item to every tracker listening on the transport, this
    /// one included.
    ///
    /// # Errors
    ///
    /// Returns an error if the item cannot be published.
    pub async fn broadcast(&self, value: Value) -> Result<(), Error> {
        self.inner.client.send(WireMessage::QueueItem(value)).await?;

        Ok(())
    }

    /// Removes and returns the oldest item of the window.
    #[must_use]
    pub fn dequeue(&self) -> Option<IndexedItem> {
        self.inner.window.state.lock().pop_front()
    }

    /// Removes and returns the item at exactly `target`.
    ///
    /// Older items are discarded. When the window does not start at `target`
    /// the history from `target` on is fetched from storage first.
    ///
    /// # Errors
    ///
    /// Returns an error if the tracker is shut down or the storage fails.
    pub async fn dequeue_at_index(
        &self,
        target: &QueueIndex,
    ) -> Result<Option<IndexedItem>, TrackerError> {
        if self.is_shut_down() {
            return Err(TrackerError::ShutDown);
        }

        {
            let mut state = self.inner.window.state.lock();

            loop {
                match state.items.front().map(|head| head.index.cmp(target)) {
                    Some(std::cmp::Ordering::Less) => {
                        state.pop_front();
                    }
                    Some(std::cmp::Ordering::Equal) => return Ok(state.pop_front()),
                    _ => break,
                }
            }
        }

        self.backfill(target).await?;

        let mut state = self.inner.window.state.lock();
        if state.items.front().is_some_and(|head| head.index == *target) {
            return Ok(state.pop_front());
        }

        Ok(None)
    }

    /// Removes and returns the oldest item after `after` and at or before
    /// `through`.
    ///
    /// Items at or before `after` are discarded. The window head is trusted
    /// without consulting storage only when it directly follows `after` in the
    /// live stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the tracker is shut down or the storage fails.
    pub async fn dequeue_between(
        &self,
        after: &QueueIndex,
        through: &QueueIndex,
    ) -> Result<Option<IndexedItem>, TrackerError> {
        if self.is_shut_down() {
            return Err(TrackerError::ShutDown);
        }

        {
            let mut state = self.inner.window.state.lock();
            state.drop_through(after);

            let contiguous = state.last_removed.as_ref() == Some(after);
            if contiguous && state.items.front().is_some_and(|head| head.index <= *through) {
                return Ok(state.pop_front());
            }
        }

        self.backfill(after).await?;

        let mut state = self.inner.window.state.lock();
        state.drop_through(after);
        if state.items.front().is_some_and(|head| head.index <= *through) {
            return Ok(state.pop_front());
        }

        Ok(None)
    }

    async fn backfill(&self, from: &QueueIndex) -> Result<(), TrackerError> {
        debug!("{} backfilling from {}", self.inner.client.id(), from);

        let values = self
            .inner
            .storage
            .items_from(from)
            .await
            .map_err(|e| TrackerError::Backfill(Box::new(e)))?;

        self.inner.window.merge_backfill(values);

        Ok(())
    }

    /// Number of items in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.window.state.lock().items.len()
    }

    /// Whether the window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the window, oldest first.
    #[must_use]
    pub fn items(&self) -> Vec<IndexedItem> {
        self.inner.window.state.lock().items.iter().cloned().collect()
    }

    /// Subscribes to tracker events.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<TrackerEvent> {
        self.inner.window.events.subscribe()
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stops listening, empties the window and shuts down the owned client.
    ///
    /// Calling this more than once is a no-op.
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
                warn!("{} tracker task failed: {}", self.inner.client.id(), e);
            }
        }

        self.inner.window.state.lock().items.clear();
        self.inner.window.events.clear();
        self.inner.client.shutdown().await?;

        Ok(())
    }
}

impl<S> fmt::Debug for IndexedQueueTracker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedQueueTracker")
            .field("id", self.inner.client.id())
            .field("window", &self.inner.window.state.lock().items.len())
            .finish_non_exhaustive()
    }
}

async fn listen(
    client_events: flume::Receiver<ClientEvent>,
    window: Arc<Window>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = client_events.recv_async() => match event {
                Ok(ClientEvent::Message(Inbound { message: WireMessage::QueueItem(value), .. })) => {
                    window.append(value);
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use beacon_realtime_memory::MemoryHub;
    use serde_json::json;
    use tokio::time::timeout;

    fn event(index: &str) -> Value {
        json!({ "index": index, "payload": format!("event {index}") })
    }

    fn storage(indexes: &[&str]) -> MemoryStorage {
        let storage = MemoryStorage::new();
        for index in indexes {
            storage.insert(QueueIndex::from(*index), event(index));
        }
        storage
    }

    fn tracker<S: IndexedStorage>(storage: S, max_window: usize) -> IndexedQueueTracker<S> {
        let client = RealtimeClient::new(MemoryHub::new().transport());
        IndexedQueueTracker::new(
            client,
            storage,
            IndexedQueueConfig { max_window },
            field_index("index"),
        )
    }

    fn window(tracker: &IndexedQueueTracker<impl IndexedStorage>) -> Vec<String> {
        tracker
            .items()
            .into_iter()
            .map(|item| item.index.to_string())
            .collect()
    }

    #[derive(Debug, thiserror::Error)]
    #[error("store offline")]
    struct Offline;

    struct OfflineStorage;

    #[async_trait]
    impl IndexedStorage for OfflineStorage {
        type Error = Offline;

        async fn items_from(&self, _from: &QueueIndex) -> Result<Vec<Value>, Offline> {
            Err(Offline)
        }
    }

    #[tokio::test]
    async fn test_push_keeps_order_and_trims_head() {
        let tracker = tracker(MemoryStorage::new(), 3);

        for index in ["002", "001", "003", "003", "004"] {
            tracker.push(event(index));
        }
        assert_eq!(tracker.push(json!({ "no": "index" })), None);

        assert_eq!(window(&tracker), vec!["002", "003", "004"]);
    }

    #[tokio::test]
    async fn test_consumed_items_are_not_readmitted() {
        let tracker = tracker(MemoryStorage::new(), 10);

        tracker.push(event("001"));
        tracker.push(event("002"));
        assert_eq!(tracker.dequeue().map(|i| i.index), Some("001".into()));

        assert_eq!(tracker.push(event("001")), None);
        assert_eq!(window(&tracker), vec!["002"]);
    }

    #[tokio::test]
    async fn test_dequeue_at_index_drops_older_items() {
        let tracker = tracker(MemoryStorage::new(), 10);
        for index in ["001", "002", "003"] {
            tracker.push(event(index));
        }

        let item = tracker.dequeue_at_index(&"002".into()).await.unwrap();

        assert_eq!(item.map(|i| i.data), Some(event("002")));
        assert_eq!(window(&tracker), vec!["003"]);
    }

    #[tokio::test]
    async fn test_dequeue_at_index_backfills_gap() {
        let tracker = tracker(storage(&["003", "004", "005", "006"]), 10);
        tracker.push(event("005"));
        tracker.push(event("006"));

        let item = tracker.dequeue_at_index(&"003".into()).await.unwrap();

        assert_eq!(item.map(|i| i.index), Some("003".into()));
        assert_eq!(window(&tracker), vec!["004", "005", "006"]);
    }

    #[tokio::test]
    async fn test_dequeue_at_index_missing_everywhere() {
        let tracker = tracker(storage(&["005"]), 10);

        assert_eq!(tracker.dequeue_at_index(&"003".into()).await.unwrap(), None);
        assert_eq!(window(&tracker), vec!["005"]);
    }

    #[tokio::test]
    async fn test_backfill_trims_tail() {
        let tracker = tracker(storage(&["001", "002", "003", "004"]), 3);
        tracker.push(event("009"));

        let item = tracker.dequeue_at_index(&"001".into()).await.unwrap();

        assert_eq!(item.map(|i| i.index), Some("001".into()));
        assert_eq!(window(&tracker), vec!["002", "003"]);
    }

    #[tokio::test]
    async fn test_dequeue_between_catches_up_in_order() {
        let tracker = tracker(storage(&["008", "009", "010"]), 10);
        let after = QueueIndex::from("007");
        let through = QueueIndex::from("010");

        let mut applied = Vec::new();
        let mut cursor = after;
        while let Some(item) = tracker.dequeue_between(&cursor, &through).await.unwrap() {
            applied.push(item.index.to_string());
            cursor = item.index;
        }

        assert_eq!(applied, vec!["008", "009", "010"]);
    }

    #[tokio::test]
    async fn test_dequeue_between_fills_hole_before_live_head() {
        let tracker = tracker(storage(&["008", "009", "010"]), 10);
        tracker.push(event("010"));

        let item = tracker
            .dequeue_between(&"007".into(), &"010".into())
            .await
            .unwrap();

        assert_eq!(item.map(|i| i.index), Some("008".into()));
    }

    #[tokio::test]
    async fn test_dequeue_between_stops_at_through() {
        let tracker = tracker(MemoryStorage::new(), 10);
        tracker.push(event("005"));

        let item = tracker
            .dequeue_between(&"003".into(), &"004".into())
            .await
            .unwrap();

        assert_eq!(item, None);
        assert_eq!(window(&tracker), vec!["005"]);
    }

    #[tokio::test]
    async fn test_backfill_failure_surfaces() {
        let tracker = tracker(OfflineStorage, 10);

        assert_matches!(
            tracker.dequeue_at_index(&"001".into()).await,
            Err(TrackerError::Backfill(_))
        );
    }

    #[tokio::test]
    async fn test_live_items_arrive_through_transport() {
        let _ = tracing_subscriber::fmt::try_init();

        let hub = MemoryHub::new();
        let consumer = IndexedQueueTracker::new(
            RealtimeClient::new(hub.transport()),
            MemoryStorage::new(),
            IndexedQueueConfig::default(),
            field_index("index"),
        );
        let producer = IndexedQueueTracker::new(
            RealtimeClient::new(hub.transport()),
            MemoryStorage::new(),
            IndexedQueueConfig::default(),
            field_index("index"),
        );
        let events = consumer.subscribe();

        consumer.client().connect().await.unwrap();
        producer.client().connect().await.unwrap();
        producer.broadcast(event("001")).await.unwrap();

        let appended = timeout(Duration::from_secs(1), events.recv_async())
            .await
            .expect("timed out")
            .expect("closed");
        assert_eq!(appended, TrackerEvent::Appended("001".into()));
        assert_eq!(consumer.len(), 1);

        consumer.shutdown().await.unwrap();
        consumer.shutdown().await.unwrap();
        assert!(consumer.is_empty());
        assert_matches!(
            consumer.dequeue_at_index(&"001".into()).await,
            Err(TrackerError::ShutDown)
        );
    }
}
