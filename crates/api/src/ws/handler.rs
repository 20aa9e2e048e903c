use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use sketchforge_events::{ProgressBroadcaster, ProgressEvent, Subscription};

use crate::state::AppState;

/// Interval between ping frames on an idle or busy connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// HTTP handler that upgrades the connection to WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.events))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Splits the socket, then:
///   1. Subscribes to the broadcaster (the first event is `connected`).
///   2. Spawns a sender task that forwards events as JSON text frames and
///      pings every [`PING_INTERVAL`].
///   3. Spawns a receiver task that drains inbound frames until close.
///   4. Unsubscribes once either side finishes.
async fn handle_socket(socket: WebSocket, events: Arc<ProgressBroadcaster>) {
    let Subscription { id, mut receiver } = events.subscribe();
    tracing::info!(subscriber_id = id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();

    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    // Closed: pruned as a slow consumer, or server shutdown.
                    let Some(event) = event else { break };
                    let Some(text) = encode(&event) else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        tracing::debug!(subscriber_id = id, "WebSocket sink closed");
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = stream.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(Message::Pong(_)) => {
                    tracing::trace!(subscriber_id = id, "Pong received");
                }
                // The stream is one-way; anything else the client sends is ignored.
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(subscriber_id = id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    events.unsubscribe(id);
    tracing::info!(subscriber_id = id, "WebSocket disconnected");
}

fn encode(event: &ProgressEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode progress event");
            None
        }
    }
}
