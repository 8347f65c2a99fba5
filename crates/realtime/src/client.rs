use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::emitter::EventEmitter;
use crate::error::Error;
use crate::wire::WireMessage;
use crate::{Lifecycle, ParticipantId, Transport, TransportEvent, TransportEventStream};

/// Decoded inbound message.
#[derive(Clone, Debug, PartialEq)]
pub struct Inbound {
    /// Sender of the message.
    pub src: ParticipantId,
    /// Whether this process sent the message itself.
    pub loopback: bool,
    /// Decoded message.
    pub message: WireMessage,
}

/// Events delivered to client subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// Transport lifecycle change.
    Lifecycle(Lifecycle),
    /// Decoded protocol message.
    Message(Inbound),
}

struct Inner {
    id: ParticipantId,
    transport: Arc<dyn Transport>,
    emitter: Arc<EventEmitter<ClientEvent>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Event client bound to one participant identity.
///
/// Owns the transport, stamps outbound packets with the participant id, decodes
/// inbound packets once and fans them out to every subscriber.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

impl RealtimeClient {
    /// Creates a client with a freshly generated participant id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_id(transport, ParticipantId::generate())
    }

    /// Creates a client with an explicit participant id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_id<T: Transport>(transport: T, id: ParticipantId) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let emitter = Arc::new(EventEmitter::new());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(dispatch(
            id.clone(),
            transport.events(),
            emitter.clone(),
            cancel.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                id,
                transport,
                emitter,
                cancel,
                task: Mutex::new(Some(task)),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// This participant's id.
    #[must_use]
    pub fn id(&self) -> &ParticipantId {
        &self.inner.id
    }

    /// Subscribes to lifecycle events and decoded messages.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<ClientEvent> {
        self.inner.emitter.subscribe()
    }

    /// Starts connecting the underlying transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is shut down or the transport refuses.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }

        self.inner.transport.connect().await?;

        Ok(())
    }

    /// Publishes a message to every participant, this one included.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded, the client is shut
    /// down, or the transport fails to publish.
    pub async fn send(&self, message: WireMessage) -> Result<(), Error> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }

        let packet = message.into_packet(self.inner.id.clone())?;

        trace!("{} sending {}", self.inner.id, packet.event);

        self.inner.transport.publish(packet).await?;

        Ok(())
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stops dispatching, drops every subscriber and shuts the transport down.
    ///
    /// Calling this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to shut down.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.cancel.cancel();

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("{} dispatch task failed: {}", self.inner.id, e);
            }
        }

        self.inner.emitter.clear();
        self.inner.transport.shutdown().await?;

        debug!("{} realtime client shut down", self.inner.id);

        Ok(())
    }
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("id", &self.inner.id)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

async fn dispatch(
    id: ParticipantId,
    mut events: TransportEventStream,
    emitter: Arc<EventEmitter<ClientEvent>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.next() => {
                let Some(event) = event else {
                    debug!("{} transport event stream ended", id);
                    break;
                };

                match event {
                    TransportEvent::Lifecycle(lifecycle) => {
                        debug!("{} transport {:?}", id, lifecycle);
                        emitter.emit(&ClientEvent::Lifecycle(lifecycle));
                    }
                    TransportEvent::Packet(packet) => match WireMessage::decode(&packet) {
                        Ok(message) => {
                            let loopback = packet.src == id;
                            emitter.emit(&ClientEvent::Message(Inbound {
                                src: packet.src,
                                loopback,
                                message,
                            }));
                        }
                        Err(e) => {
                            debug!("{} dropping packet from {}: {}", id, packet.src, e);
                        }
                    },
                }
            }
        }
    }
}
