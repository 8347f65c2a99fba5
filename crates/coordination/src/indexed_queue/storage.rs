use std::collections::BTreeMap;
use std::convert::Infallible;
use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::QueueIndex;

/// Durable history of the indexed event log, used to fill gaps.
#[async_trait]
pub trait IndexedStorage: Send + Sync + 'static {
    /// Storage failure.
    type Error: StdError + Send + Sync + 'static;

    /// Returns every stored value with an index at or after `from`, oldest first.
    async fn items_from(&self, from: &QueueIndex) -> Result<Vec<Value>, Self::Error>;
}

/// In-memory history keyed by index.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    items: Arc<RwLock<BTreeMap<QueueIndex, Value>>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `index`, replacing any previous value.
    pub fn insert(&self, index: QueueIndex, value: Value) {
        self.items.write().insert(index, value);
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

#[async_trait]
impl IndexedStorage for MemoryStorage {
    type Error = Infallible;

    async fn items_from(&self, from: &QueueIndex) -> Result<Vec<Value>, Self::Error> {
        Ok(self
            .items
            .read()
            .range(from.clone()..)
            .map(|(_, value)| value.clone())
            .collect())
    }
}
