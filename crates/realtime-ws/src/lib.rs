//! WebSocket realtime transport
//!
//! Connects to a relay that re-broadcasts every frame to every connected socket.
//! Packets travel as JSON text frames. The transport keeps reconnecting after
//! failures and reports progress through lifecycle events:
//! - `Connect` + `Ready` after the first successful connection
//! - `Disconnect` whenever an established connection drops
//! - `Reconnect` + `Ready` after every later successful connection
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use beacon_realtime::{
    Lifecycle, Packet, Transport, TransportError, TransportEvent, TransportEventStream,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Options for the WebSocket transport
#[derive(Clone, Debug)]
pub struct WebSocketOptions {
    /// Relay endpoint (`ws://` or `wss://`)
    pub url: Url,
    /// Delay between reconnection attempts
    pub reconnect_delay: Duration,
}

impl WebSocketOptions {
    /// Create options for the given endpoint with the default reconnect delay
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not use the `ws` or `wss` scheme.
    pub fn new(url: Url) -> Result<Self, Error> {
        match url.scheme() {
            "ws" | "wss" => Ok(Self {
                url,
                reconnect_delay: Duration::from_secs(1),
            }),
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }
}

struct Inner {
    options: WebSocketOptions,
    events_tx: flume::Sender<TransportEvent>,
    events_rx: flume::Receiver<TransportEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

/// WebSocket transport implementation
#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport with options
    #[must_use]
    pub fn new(options: WebSocketOptions) -> Self {
        let (events_tx, events_rx) = flume::unbounded();

        Self {
            inner: Arc::new(Inner {
                options,
                events_tx,
                events_rx,
                outbound: Mutex::new(None),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Whether a connection is currently established
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().is_some()
    }
}

impl Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("options", &self.inner.options)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.inner.cancel.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let task = tokio::spawn(run(self.inner.clone()));
        *self.inner.task.lock() = Some(task);

        Ok(())
    }

    async fn publish(&self, packet: Packet) -> Result<(), TransportError> {
        let json = serde_json::to_string(&packet)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;

        let outbound = self.inner.outbound.lock().clone();

        match outbound {
            Some(outbound) => outbound
                .send(json)
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::NotConnected),
        }
    }

    fn events(&self) -> TransportEventStream {
        Box::pin(self.inner.events_rx.clone().into_stream())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.inner.cancel.cancel();

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| TransportError::Other(format!("connection task failed: {e}")))?;
        }

        Ok(())
    }
}

/// Connection loop: connect, pump frames until the socket drops, wait, retry.
async fn run(inner: Arc<Inner>) {
    let mut connected_once = false;
    let mut first_attempt = true;

    loop {
        if !first_attempt {
            tokio::select! {
                () = inner.cancel.cancelled() => break,
                () = tokio::time::sleep(inner.options.reconnect_delay) => {}
            }
        }
        first_attempt = false;

        let stream = tokio::select! {
            () = inner.cancel.cancelled() => break,
            result = connect_async(inner.options.url.as_str()) => match result {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("WebSocket connect to {} failed: {}", inner.options.url, e);
                    continue;
                }
            },
        };

        info!("Connected to {}", inner.options.url);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        *inner.outbound.lock() = Some(outbound_tx);

        let lifecycle = if connected_once {
            Lifecycle::Reconnect
        } else {
            Lifecycle::Connect
        };
        connected_once = true;
        let _ = inner.events_tx.send(TransportEvent::Lifecycle(lifecycle));
        let _ = inner.events_tx.send(TransportEvent::Lifecycle(Lifecycle::Ready));

        let (mut sink, mut frames) = stream.split();

        let cancelled = loop {
            tokio::select! {
                () = inner.cancel.cancelled() => {
                    let _ = sink.close().await;
                    break true;
                }
                Some(json) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        warn!("WebSocket send failed: {}", e);
                        break false;
                    }
                }
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => deliver(&inner, text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => deliver(&inner, &data),
                    Some(Ok(Message::Close(_))) | None => break false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket receive failed: {}", e);
                        break false;
                    }
                },
            }
        };

        *inner.outbound.lock() = None;
        let _ = inner
            .events_tx
            .send(TransportEvent::Lifecycle(Lifecycle::Disconnect));

        if cancelled {
            break;
        }

        info!("Disconnected from {}, reconnecting", inner.options.url);
    }

    debug!("WebSocket connection loop for {} stopped", inner.options.url);
}

fn deliver(inner: &Inner, bytes: &[u8]) {
    match serde_json::from_slice::<Packet>(bytes) {
        Ok(packet) => {
            let _ = inner.events_tx.send(TransportEvent::Packet(packet));
        }
        Err(e) => debug!("Ignoring malformed frame: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_reject_http_scheme() {
        let url = Url::parse("http://localhost:8080/ws").unwrap();

        assert!(matches!(
            WebSocketOptions::new(url),
            Err(Error::UnsupportedScheme(scheme)) if scheme == "http"
        ));
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let _ = tracing_subscriber::fmt::try_init();

        let options = WebSocketOptions::new(Url::parse("ws://127.0.0.1:9/ws").unwrap()).unwrap();
        let transport = WebSocketTransport::new(options);

        let packet = Packet {
            src: "a".into(),
            event: "presence:join".to_string(),
            data: serde_json::Value::Null,
        };

        assert!(matches!(
            transport.publish(packet).await,
            Err(TransportError::NotConnected)
        ));
    }
}
