// crates/server/src/sse.rs
//! Server-Sent-Events bridge for streaming AI analyses.
//!
//! The AI collaborator yields a lazy sequence of text chunks; each chunk is
//! written as one `chunk` event, followed by a `done` terminator when the
//! sequence ends. Closing the connection drops the stream, which cancels
//! generation — no terminator is sent in that case.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("generation failed: {0}")]
    Failed(String),
}

/// Text-generation collaborator.
///
/// Implementations must stop generating when the returned stream is
/// dropped; that is the cancellation path for disconnected clients.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str) -> BoxStream<'static, Result<String, GeneratorError>>;
}

#[derive(Debug, Deserialize)]
pub struct AiStreamParams {
    pub prompt: String,
}

/// GET /api/ai/stream?prompt=...
pub async fn ai_stream_handler(
    Query(params): Query<AiStreamParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if params.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".into()));
    }
    let generator = state
        .generator
        .clone()
        .ok_or_else(|| ApiError::Unavailable("no AI provider configured".into()))?;

    debug!(prompt_len = params.prompt.len(), "starting AI stream");
    let mut chunks = generator.generate(&params.prompt);

    let stream = async_stream::stream! {
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(text) => yield Ok(Event::default().event("chunk").data(text)),
                Err(e) => {
                    warn!(error = %e, "AI stream aborted");
                    yield Ok(Event::default().event("error").data(e.to_string()));
                    return;
                }
            }
        }
        yield Ok(Event::default().event("done").data(""));
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
