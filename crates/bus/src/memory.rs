// crates/bus/src/memory.rs
//! In-process bus double.
//!
//! Submissions flow through a shared queue that competing consumers drain
//! one message at a time; progress events fan out over a broadcast channel
//! with per-subscription filtering. Semantics mirror the production bus:
//! at-least-once submissions (via [`MemoryBus::redeliver`]) and lossy,
//! no-catch-up progress.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::{
    BusError, JobBus, JobDelivery, JobStream, JobSubmitMessage, ProgressEvent, ProgressStream,
};

pub struct MemoryBus {
    submit_tx: mpsc::UnboundedSender<(JobSubmitMessage, bool)>,
    submit_rx: Arc<Mutex<mpsc::UnboundedReceiver<(JobSubmitMessage, bool)>>>,
    progress_tx: broadcast::Sender<ProgressEvent>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (progress_tx, _) = broadcast::channel(256);
        Self {
            submit_tx,
            submit_rx: Arc::new(Mutex::new(submit_rx)),
            progress_tx,
        }
    }

    /// Simulate the stream redelivering an unacknowledged message (the
    /// consumer died mid-job).
    pub fn redeliver(&self, message: JobSubmitMessage) {
        let _ = self.submit_tx.send((message, true));
    }

    /// Number of progress subscribers currently listening.
    pub fn progress_subscriber_count(&self) -> usize {
        self.progress_tx.receiver_count()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobBus for MemoryBus {
    async fn submit(&self, message: &JobSubmitMessage) -> Result<(), BusError> {
        self.submit_tx
            .send((message.clone(), false))
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe_job_submits(&self) -> Result<JobStream, BusError> {
        let rx = Arc::clone(&self.submit_rx);
        let deliveries = async_stream::stream! {
            loop {
                // Competing consumers take turns on the shared receiver;
                // each message goes to exactly one of them.
                let next = rx.lock().await.recv().await;
                match next {
                    Some((message, redelivered)) => {
                        yield JobDelivery::unacked(message, redelivered);
                    }
                    None => break,
                }
            }
        };
        Ok(Box::pin(deliveries))
    }

    async fn publish_progress(&self, event: &ProgressEvent) -> Result<(), BusError> {
        // No subscribers is fine; progress is best-effort.
        let _ = self.progress_tx.send(event.clone());
        Ok(())
    }

    async fn subscribe_progress(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<ProgressStream, BusError> {
        let mut rx = self.progress_tx.subscribe();
        let events = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) if event.tenant_id == tenant_id && event.job_id == job_id => {
                        yield event;
                    }
                    Ok(_) => continue,
                    // Lagged receivers skip ahead; receivers may observe
                    // dropped events but never reordering.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(events))
    }
}
