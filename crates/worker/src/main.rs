// crates/worker/src/main.rs
//! Worker binary: connects the stores and the bus, then consumes job
//! submissions with bounded concurrency until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arlens_bus::{JobBus, NatsBus};
use arlens_db::{ClickHouseStore, PgMetadataStore, RedisCache, S3BlobStore, S3Config};
use arlens_search::SearchIndex;
use arlens_worker::{
    process_job, AnalyzerConfig, CommandAnalyzer, ProcessorConfig, WorkerConfig, WorkerContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = WorkerConfig::parse();
    info!(concurrency = config.job_concurrency, "starting worker");

    // Pools are shared process-wide and sized to the job concurrency.
    let meta = PgMetadataStore::connect(&config.database_url, config.job_concurrency as u32)
        .await
        .context("connect postgres")?;
    let columnar = ClickHouseStore::connect(&config.clickhouse_url, &config.clickhouse_database)
        .await
        .context("connect clickhouse")?;
    let cache = RedisCache::connect(&config.redis_url)
        .await
        .context("connect redis")?;
    let blob = S3BlobStore::connect(S3Config {
        bucket: config.s3_bucket.clone(),
        endpoint: config.s3_endpoint.clone(),
        skip_bucket_check: config.s3_skip_bucket_check,
    })
    .await
    .context("connect blob store")?;
    let bus = Arc::new(
        NatsBus::connect(&config.nats_url)
            .await
            .context("connect nats")?,
    );
    let search = Arc::new(SearchIndex::open(&config.search_dir).context("open search index")?);

    let analyzer = CommandAnalyzer::new(AnalyzerConfig::java(
        &config.java_bin,
        &config.analyzer_jar,
        config.parser_timeout(),
    ));

    let ctx = Arc::new(WorkerContext {
        meta: Arc::new(meta),
        columnar: Arc::new(columnar),
        blob: Arc::new(blob),
        cache: Arc::new(cache),
        bus: bus.clone(),
        search,
        analyzer: Arc::new(analyzer),
        config: ProcessorConfig {
            anomaly_threshold: config.anomaly_threshold,
            cache_ttl: arlens_db::DEFAULT_CACHE_TTL,
            job_timeout: config.job_timeout(),
        },
    });

    let mut deliveries = bus
        .subscribe_job_submits()
        .await
        .context("subscribe job submissions")?;

    let semaphore = Arc::new(Semaphore::new(config.job_concurrency));
    let shutdown = CancellationToken::new();

    info!("worker ready, waiting for jobs");
    loop {
        let delivery = tokio::select! {
            delivery = deliveries.next() => match delivery {
                Some(delivery) => delivery,
                None => {
                    warn!("job stream closed, shutting down");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, cancelling in-flight jobs");
                shutdown.cancel();
                break;
            }
        };

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let ctx = Arc::clone(&ctx);
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            let _permit = permit;
            let message = delivery.message.clone();
            let redelivered = delivery.redelivered;
            let outcome = process_job(&ctx, &message, redelivered, cancel).await;
            info!(job_id = %message.job_id, ?outcome, "delivery handled");
            // Ack after the terminal state is persisted; an unacked message
            // is redelivered to another worker for resume.
            if let Err(err) = delivery.ack().await {
                error!(job_id = %message.job_id, error = %err, "ack failed");
            }
        });
    }

    // Let in-flight jobs observe cancellation before the pools drop.
    let _ = semaphore
        .acquire_many(config.job_concurrency as u32)
        .await;
    info!("worker stopped");
    Ok(())
}
