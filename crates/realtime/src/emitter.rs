use std::fmt;

use parking_lot::Mutex;

/// Explicit, per-component list of event subscribers.
///
/// Every subscriber gets its own unbounded queue so a slow consumer never
/// causes another to miss events. Subscribers whose receiver was dropped are
/// pruned on the next emit.
pub struct EventEmitter<E> {
    subscribers: Mutex<Vec<flume::Sender<E>>>,
}

impl<E> EventEmitter<E>
where
    E: Clone + Send + 'static,
{
    /// Creates an emitter without subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> flume::Receiver<E> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Delivers an event to every live subscriber.
    pub fn emit(&self, event: &E) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drops every subscriber; their receivers observe disconnection.
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }
}

impl<E> Default for EventEmitter<E>
where
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}
