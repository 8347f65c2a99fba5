//! WebSocket relay for the realtime transport
//!
//! Re-broadcasts every text frame received on any socket to every connected
//! socket, the sender included. It keeps no state beyond the open sockets.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::net::SocketAddr;

use axum::Router;
use axum::extract::{ConnectInfo, State};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds the relay router serving sockets at `path`.
///
/// `capacity` bounds how many frames a slow socket may lag behind before it
/// starts missing frames.
pub fn router(path: &str, capacity: usize) -> Router {
    let (frames, _) = broadcast::channel::<Message>(capacity);

    Router::new().route(path, get(upgrade)).with_state(frames)
}

/// Serves the relay on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    path: &str,
    capacity: usize,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    info!("Relay listening on {}{}", listener.local_addr()?, path);

    axum::serve(
        listener,
        router(path, capacity).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    info!("Relay stopped");

    Ok(())
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(frames): State<broadcast::Sender<Message>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay(socket, peer, frames))
}

async fn relay(socket: WebSocket, peer: SocketAddr, frames: broadcast::Sender<Message>) {
    debug!("{} connected", peer);

    let (mut sink, mut stream) = socket.split();
    let mut inbound = frames.subscribe();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(message @ Message::Text(_))) => {
                    let _ = frames.send(message);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("{} receive failed: {}", peer, e);
                    break;
                }
            },
            message = inbound.recv() => match message {
                Ok(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("{} lagging, skipped {} frame(s)", peer, skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    debug!("{} disconnected", peer);
}
