// crates/bus/src/nats.rs
//! NATS-backed bus: JetStream for the durable job queue, core NATS for
//! transient progress subjects.

use async_nats::jetstream;
use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::consumer::AckPolicy;
use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    progress_subject, submit_subject, BusError, JobBus, JobDelivery, JobStream, JobSubmitMessage,
    ProgressEvent, ProgressStream, SUBMIT_WILDCARD,
};

const STREAM_NAME: &str = "ARLENS_JOBS";
const CONSUMER_NAME: &str = "arlens-workers";

/// Bus over one NATS connection shared by publishers and consumers.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsBus {
    /// Connect and ensure the durable job stream exists.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connect(format!("{url}: {e}")))?;
        let jetstream = jetstream::new(client.clone());

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: STREAM_NAME.to_string(),
                subjects: vec![SUBMIT_WILDCARD.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Connect(format!("stream {STREAM_NAME}: {e}")))?;

        info!(url, "connected to NATS");
        Ok(Self { client, jetstream })
    }
}

#[async_trait]
impl JobBus for NatsBus {
    async fn submit(&self, message: &JobSubmitMessage) -> Result<(), BusError> {
        let payload = serde_json::to_vec(message)?;
        let subject = submit_subject(message.tenant_id);
        let ack = self
            .jetstream
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| BusError::Publish(format!("{subject}: {e}")))?;
        // Wait for the stream to persist the message.
        ack.await
            .map_err(|e| BusError::Publish(format!("{subject}: {e}")))?;
        Ok(())
    }

    async fn subscribe_job_submits(&self) -> Result<JobStream, BusError> {
        let stream = self
            .jetstream
            .get_stream(STREAM_NAME)
            .await
            .map_err(|e| BusError::Subscribe(format!("stream {STREAM_NAME}: {e}")))?;

        let consumer = stream
            .get_or_create_consumer(
                CONSUMER_NAME,
                pull::Config {
                    durable_name: Some(CONSUMER_NAME.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("consumer {CONSUMER_NAME}: {e}")))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let deliveries = async_stream::stream! {
            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "job stream pull failed, continuing");
                        continue;
                    }
                };
                let submit: JobSubmitMessage = match serde_json::from_slice(&message.payload) {
                    Ok(submit) => submit,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable job submission");
                        // Ack poison messages so they stop redelivering.
                        if let Err(e) = message.ack().await {
                            warn!(error = %e, "failed to ack poison message");
                        }
                        continue;
                    }
                };
                let redelivered = message
                    .info()
                    .map(|info| info.delivered > 1)
                    .unwrap_or(false);
                yield JobDelivery::with_acker(
                    submit,
                    redelivered,
                    Box::new(move || {
                        Box::pin(async move {
                            message
                                .ack()
                                .await
                                .map_err(|e| BusError::Publish(e.to_string()))
                        })
                    }),
                );
            }
        };
        Ok(Box::pin(deliveries))
    }

    async fn publish_progress(&self, event: &ProgressEvent) -> Result<(), BusError> {
        let payload = serde_json::to_vec(event)?;
        let subject = progress_subject(event.tenant_id, event.job_id);
        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| BusError::Publish(format!("{subject}: {e}")))
    }

    async fn subscribe_progress(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<ProgressStream, BusError> {
        let subject = progress_subject(tenant_id, job_id);
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| BusError::Subscribe(format!("{subject}: {e}")))?;

        let events = async_stream::stream! {
            while let Some(message) = subscriber.next().await {
                match serde_json::from_slice::<ProgressEvent>(&message.payload) {
                    Ok(event) => yield event,
                    Err(e) => warn!(error = %e, "skipping undecodable progress event"),
                }
            }
        };
        Ok(Box::pin(events))
    }
}
