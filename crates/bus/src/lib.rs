// crates/bus/src/lib.rs
//! Job queue and progress fan-out over a pub/sub bus.
//!
//! Two delivery disciplines share one connection:
//! - job submissions ride a durable stream with explicit acknowledgement
//!   (at-least-once; consumer idempotency comes from the atomic job claim);
//! - progress events are fire-and-forget on transient per-job subjects.
//!
//! [`NatsBus`] is the production implementation; [`MemoryBus`] is the
//! in-process double used by pipeline tests.

pub mod memory;
pub mod nats;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use arlens_core::JobStatus;

pub use memory::MemoryBus;
pub use nats::NatsBus;

/// Subject for job submissions of one tenant.
pub fn submit_subject(tenant_id: Uuid) -> String {
    format!("jobs.submit.{tenant_id}")
}

/// Wildcard covering every tenant's submissions.
pub const SUBMIT_WILDCARD: &str = "jobs.submit.*";

/// Subject for progress events of one job.
pub fn progress_subject(tenant_id: Uuid, job_id: Uuid) -> String {
    format!("jobs.progress.{tenant_id}.{job_id}")
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connect failed: {0}")]
    Connect(String),

    #[error("bus publish failed: {0}")]
    Publish(String),

    #[error("bus subscribe failed: {0}")]
    Subscribe(String),

    #[error("bus message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A job submission message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmitMessage {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
}

/// One progress event on a job's transient subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub status: String,
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        tenant_id: Uuid,
        job_id: Uuid,
        status: JobStatus,
        percent: u8,
        note: Option<String>,
    ) -> Self {
        Self {
            job_id,
            tenant_id,
            status: status.as_str().to_string(),
            percent,
            note,
            timestamp: Utc::now(),
        }
    }
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BusError>> + Send>;

/// One delivery off the durable job stream.
///
/// `redelivered` is true when the bus has handed this message out before
/// (the previous consumer died without acknowledging); processors use it to
/// distinguish crash recovery from concurrent duplicates.
pub struct JobDelivery {
    pub message: JobSubmitMessage,
    pub redelivered: bool,
    acker: Option<AckFn>,
}

impl JobDelivery {
    /// A delivery with a no-op acknowledgement (in-process buses, tests).
    pub fn unacked(message: JobSubmitMessage, redelivered: bool) -> Self {
        Self {
            message,
            redelivered,
            acker: None,
        }
    }

    pub fn with_acker(message: JobSubmitMessage, redelivered: bool, acker: AckFn) -> Self {
        Self {
            message,
            redelivered,
            acker: Some(acker),
        }
    }

    /// Acknowledge the delivery so the stream will not redeliver it. Called
    /// once the job has reached a terminal state.
    pub async fn ack(mut self) -> Result<(), BusError> {
        match self.acker.take() {
            Some(ack) => ack().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for JobDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDelivery")
            .field("message", &self.message)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type JobStream = Pin<Box<dyn Stream<Item = JobDelivery> + Send>>;
pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// Bus capability: durable job delivery plus transient event fan-out.
#[async_trait]
pub trait JobBus: Send + Sync {
    /// Publish a job submission onto the durable stream (at-least-once).
    async fn submit(&self, message: &JobSubmitMessage) -> Result<(), BusError>;

    /// Consume job submissions across all tenants. Consumers in the same
    /// group compete for messages; handling is serial per consumer.
    async fn subscribe_job_submits(&self) -> Result<JobStream, BusError>;

    /// Publish a progress event, fire-and-forget. Callers log and drop
    /// failures rather than blocking the processor.
    async fn publish_progress(&self, event: &ProgressEvent) -> Result<(), BusError>;

    /// Subscribe to one job's progress subject. No catch-up: only events
    /// published after subscription are observed.
    async fn subscribe_progress(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<ProgressStream, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_layout() {
        let tenant = Uuid::nil();
        let job = Uuid::nil();
        assert_eq!(submit_subject(tenant), format!("jobs.submit.{tenant}"));
        assert_eq!(
            progress_subject(tenant, job),
            format!("jobs.progress.{tenant}.{job}")
        );
    }

    #[test]
    fn test_progress_event_json_shape() {
        let event = ProgressEvent::new(Uuid::nil(), Uuid::nil(), JobStatus::Parsing, 5, None);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\":\"parsing\""));
        assert!(json.contains("\"percent\":5"));
        assert!(!json.contains("note"));

        let event = ProgressEvent::new(
            Uuid::nil(),
            Uuid::nil(),
            JobStatus::Failed,
            40,
            Some("analyzer exited with status 2".into()),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("analyzer exited"));
    }

    #[tokio::test]
    async fn test_unacked_delivery_ack_is_noop() {
        let delivery = JobDelivery::unacked(
            JobSubmitMessage {
                job_id: Uuid::new_v4(),
                tenant_id: Uuid::new_v4(),
            },
            false,
        );
        assert!(!delivery.redelivered);
        delivery.ack().await.unwrap();
    }
}
