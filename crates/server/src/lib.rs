// crates/server/src/lib.rs
//! Streaming fan-out server: bridges per-job progress subjects to
//! WebSocket clients and AI token streams to Server-Sent Events.

pub mod error;
pub mod sse;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use sse::{GeneratorError, TextGenerator};
pub use state::AppState;

/// Build the application router.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/tenants/{tenant_id}/jobs/{job_id}/stream",
            get(ws::job_stream_handler),
        )
        .route("/api/ai/stream", get(sse::ai_stream_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptimeSecs": state.uptime_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arlens_bus::MemoryBus;

    #[tokio::test]
    async fn test_create_app() {
        let state = AppState::new(Arc::new(MemoryBus::new()), None);
        let _app = create_app(state);
    }
}
