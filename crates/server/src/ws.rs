// crates/server/src/ws.rs
//! WebSocket bridge from per-job progress subjects to connected clients.
//!
//! Each client subscribes to one `(tenant, job)` pair; every bus event is
//! forwarded as one text frame. There is no catch-up: clients connecting
//! mid-stream only see subsequent events. Disconnection is silent.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::AppState;

/// GET /api/tenants/{tenant_id}/jobs/{job_id}/stream
pub async fn job_stream_handler(
    ws: WebSocketUpgrade,
    Path((tenant_id, job_id)): Path<(Uuid, Uuid)>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, tenant_id, job_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, tenant_id: Uuid, job_id: Uuid) {
    let mut events = match state.bus.subscribe_progress(tenant_id, job_id).await {
        Ok(events) => events,
        Err(e) => {
            warn!(%tenant_id, %job_id, error = %e, "progress subscribe failed");
            return;
        }
    };

    debug!(%tenant_id, %job_id, "client subscribed to job stream");
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable progress event");
                        continue;
                    }
                };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Pings are answered by axum; other frames are ignored.
                    _ => {}
                }
            }
        }
    }

    debug!(%tenant_id, %job_id, "client disconnected from job stream");
}
