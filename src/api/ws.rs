// =============================================================================
// WebSocket Handler — push-based session-state updates
// =============================================================================
//
// Clients connect to `/api/v1/ws[?refresh_ms=N]` and receive:
//   1. An immediate full state export on connect.
//   2. Incremental (delta-cursor) exports whenever the session version has
//      changed since the last push, checked every `refresh_ms` (default
//      500 ms, clamped to 100..=60000).
//
// Ping frames are answered with Pong; the loop ends on Close or send
// failure.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::system::SystemManager;

#[derive(Deserialize)]
pub struct WsQuery {
    refresh_ms: Option<u64>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(manager): State<Arc<SystemManager>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let refresh_ms = query.refresh_ms.unwrap_or(500).clamp(100, 60_000);
    info!(refresh_ms, "session WebSocket accepted");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, manager, refresh_ms))
}

async fn handle_ws_connection(socket: WebSocket, manager: Arc<SystemManager>, refresh_ms: u64) {
    let (mut sender, mut receiver) = socket.split();

    // Initial full snapshot.
    let full = manager.export_state(true);
    if sender
        .send(Message::Text(full.to_string()))
        .await
        .is_err()
    {
        return;
    }
    let mut last_version = manager.session_version();

    let mut push_interval = interval(Duration::from_millis(refresh_ms));

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                let version = manager.session_version();
                if version != last_version {
                    let delta = manager.export_state(false);
                    if sender.send(Message::Text(delta.to_string())).await.is_err() {
                        debug!("WebSocket send failed; disconnecting");
                        break;
                    }
                    last_version = version;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket closed by client");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    info!("session WebSocket disconnected");
}
