//! WebSocket transport.
//!
//! `GET /ws` upgrades to a WebSocket. Each text frame carries one JSON
//! request; each outbound frame is one JSON reply or event. A single task
//! owns the socket and selects between inbound frames, the connection's
//! outbound queue and the idle deadline.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;

use crate::connection::Connection;
use crate::protocol::{Envelope, Outbound};
use crate::server::{OUTBOUND_QUEUE, SharedState};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<SharedState>) {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let conn = Connection::open(Arc::clone(&state), tx);
    let id = conn.id();
    let idle = Duration::from_secs(state.config.idle_timeout_secs);

    // Run the connection in its own task so a panic stays contained.
    let task = tokio::spawn(drive(socket, conn, rx, idle));
    if let Err(e) = task.await {
        tracing::error!(conn = %id, "Connection task failed: {e}");
        state.cleanup_connection(id);
    }
}

async fn drive(
    mut socket: WebSocket,
    mut conn: Connection,
    mut rx: mpsc::Receiver<Outbound>,
    idle: Duration,
) {
    let id = conn.id();
    let mut deadline = Instant::now() + idle;

    loop {
        tokio::select! {
            frame = socket.recv() => {
                deadline = Instant::now() + idle;
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<Envelope>(text.as_str()) {
                            Ok(envelope) => conn.handle(envelope).await,
                            Err(e) => tracing::debug!(conn = %id, "Ignoring malformed frame: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ping/Pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(conn = %id, "WebSocket error: {e}");
                        break;
                    }
                }
            }
            out = rx.recv() => {
                let Some(out) = out else { break };
                let Some(text) = out.to_frame() else {
                    if matches!(out, Outbound::Close) {
                        break;
                    }
                    continue;
                };
                match tokio::time::timeout(SEND_TIMEOUT, socket.send(WsMessage::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        tracing::debug!(conn = %id, "WebSocket send failed or timed out");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::info!(conn = %id, "Idle timeout");
                break;
            }
        }
    }

    conn.close();
    // Flush whatever was queued before the close (e.g. a ban notice).
    while let Ok(out) = rx.try_recv() {
        if let Some(text) = out.to_frame() {
            let _ = socket.send(WsMessage::Text(text.into())).await;
        }
    }
    let _ = socket.send(WsMessage::Close(None)).await;
}
