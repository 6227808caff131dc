// crates/worker/src/processor.rs
//! Job processor: drives one analysis job through the state machine
//! `queued → parsing → analyzing → storing → complete`.
//!
//! Ownership is taken by the atomic `queued → parsing` claim; every later
//! transition is persisted before the side effects that depend on it. A
//! worker that dies mid-job leaves the persisted state behind, the bus
//! redelivers the message, and the next worker resumes from that state:
//! decoding and aggregation are pure and re-run, the storing side effects
//! are idempotent (replacing inserts, delete-then-add indexing, keyed cache
//! writes).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use arlens_bus::{JobBus, JobSubmitMessage, ProgressEvent};
use arlens_core::{
    build_enhanced_sections, detect_anomalies, extract_log_entries, parse_output, AnomalyKind,
    DashboardData, EnhancedSections, JobStatus, ParseError, DEFAULT_ANOMALY_THRESHOLD,
};
use arlens_db::{
    with_retries, ArtifactCache, BlobStore, ColumnarStore, DbError, MetadataStore,
    DEFAULT_CACHE_TTL,
};
use arlens_search::{LogDocument, SearchError, SearchIndex};

use crate::analyzer::{Analyzer, AnalyzerError};

/// Progress checkpoints at state boundaries.
const PROGRESS_DOWNLOADED: u8 = 5;
const PROGRESS_PARSED: u8 = 40;
const PROGRESS_AGGREGATED: u8 = 60;
const PROGRESS_COMPLETE: u8 = 100;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error(transparent)]
    Decode(#[from] ParseError),

    #[error(transparent)]
    Storage(#[from] DbError),

    #[error(transparent)]
    Index(#[from] SearchError),

    #[error("staging failed: {0}")]
    Staging(#[from] std::io::Error),

    #[error("job cancelled")]
    Cancelled,
}

impl WorkerError {
    /// Short human-readable reason persisted on the failed job row. The
    /// full diagnostic stays in the logs.
    pub fn short_reason(&self) -> String {
        match self {
            WorkerError::Analyzer(AnalyzerError::Timeout { .. }) => "ParserTimeout".to_string(),
            WorkerError::Analyzer(AnalyzerError::Failed { detail }) => {
                format!("ParserFailed: {detail}")
            }
            WorkerError::Analyzer(AnalyzerError::Cancelled) | WorkerError::Cancelled => {
                "Cancelled".to_string()
            }
            WorkerError::Analyzer(AnalyzerError::Io(e)) => format!("ParserFailed: {e}"),
            WorkerError::Decode(e) => format!("decode failed: {e}"),
            WorkerError::Storage(e) => format!("storage failed: {e}"),
            WorkerError::Index(e) => format!("indexing failed: {e}"),
            WorkerError::Staging(e) => format!("staging failed: {e}"),
        }
    }
}

/// Terminal result of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    /// The delivery produced no side effects: the claim was lost to a
    /// concurrent processor, or the job was already terminal.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub anomaly_threshold: f64,
    pub cache_ttl: Duration,
    /// Wall-clock budget for the whole job, analyzer included.
    pub job_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: DEFAULT_ANOMALY_THRESHOLD,
            cache_ttl: DEFAULT_CACHE_TTL,
            job_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Everything a processor needs, behind capability traits so tests run on
/// in-memory doubles.
pub struct WorkerContext {
    pub meta: Arc<dyn MetadataStore>,
    pub columnar: Arc<dyn ColumnarStore>,
    pub blob: Arc<dyn BlobStore>,
    pub cache: Arc<dyn ArtifactCache>,
    pub bus: Arc<dyn JobBus>,
    pub search: Arc<SearchIndex>,
    pub analyzer: Arc<dyn Analyzer>,
    pub config: ProcessorConfig,
}

/// Process one delivery to a terminal outcome. Never returns an error: any
/// pipeline failure is classified, persisted on the job row, and reported
/// as [`JobOutcome::Failed`].
pub async fn process_job(
    ctx: &WorkerContext,
    message: &JobSubmitMessage,
    redelivered: bool,
    cancel: CancellationToken,
) -> JobOutcome {
    let tenant_id = message.tenant_id;
    let job_id = message.job_id;
    let started = Instant::now();

    let pipeline = run_pipeline(ctx, tenant_id, job_id, redelivered, &cancel);
    let outcome = match tokio::time::timeout(ctx.config.job_timeout, pipeline).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            warn!(%tenant_id, %job_id, error = %err, "job failed");
            fail_job(ctx, tenant_id, job_id, &err.short_reason()).await;
            JobOutcome::Failed
        }
        Err(_) => {
            warn!(%tenant_id, %job_id, "job exceeded wall-clock budget");
            fail_job(ctx, tenant_id, job_id, "JobTimeout").await;
            JobOutcome::Failed
        }
    };
    if outcome != JobOutcome::Skipped {
        histogram!("arlens_job_duration_seconds").record(started.elapsed().as_secs_f64());
    }
    outcome
}

async fn run_pipeline(
    ctx: &WorkerContext,
    tenant_id: Uuid,
    job_id: Uuid,
    redelivered: bool,
    cancel: &CancellationToken,
) -> Result<JobOutcome, WorkerError> {
    // Take ownership. The claim is the only entry point for fresh jobs; a
    // redelivered message may instead resume a job its previous owner
    // abandoned mid-flight.
    let claimed = ctx.meta.claim_job(tenant_id, job_id).await?;
    let start_state = if claimed {
        JobStatus::Parsing
    } else if redelivered {
        let job = ctx.meta.get_job(tenant_id, job_id).await?;
        match job.status {
            JobStatus::Parsing | JobStatus::Analyzing | JobStatus::Storing => job.status,
            other => {
                debug!(%job_id, status = other.as_str(), "redelivery for settled job, skipping");
                return Ok(JobOutcome::Skipped);
            }
        }
    } else {
        // A concurrent processor holds the job; exit without side effects.
        debug!(%job_id, "claim lost, skipping");
        return Ok(JobOutcome::Skipped);
    };

    info!(
        %tenant_id,
        %job_id,
        state = start_state.as_str(),
        resumed = !claimed,
        "processing job"
    );

    let job = ctx.meta.get_job(tenant_id, job_id).await?;
    let file = with_retries("get_file", || ctx.meta.get_file(tenant_id, job.file_id)).await?;

    // ---- parsing: stage the file and run the analyzer -------------------
    let bytes = with_retries("download", || ctx.blob.get(&file.object_key)).await?;
    // Staging directory is removed on drop, whatever exit path is taken.
    let staging = tempfile::tempdir()?;
    let local_path = staging.path().join(&file.filename);
    tokio::fs::write(&local_path, &bytes).await?;

    if start_state == JobStatus::Parsing {
        ctx.meta
            .set_progress(tenant_id, job_id, PROGRESS_DOWNLOADED)
            .await?;
        publish_progress(ctx, tenant_id, job_id, JobStatus::Parsing, PROGRESS_DOWNLOADED, None)
            .await;
    }
    if cancel.is_cancelled() {
        return Err(WorkerError::Cancelled);
    }

    let report = ctx.analyzer.run(&local_path, job.heap_mb, cancel).await?;
    let result = parse_output(&report)?;

    if start_state == JobStatus::Parsing {
        if !ctx
            .meta
            .transition(tenant_id, job_id, JobStatus::Parsing, JobStatus::Analyzing)
            .await?
        {
            return Ok(JobOutcome::Skipped);
        }
        ctx.meta
            .set_progress(tenant_id, job_id, PROGRESS_PARSED)
            .await?;
        publish_progress(ctx, tenant_id, job_id, JobStatus::Analyzing, PROGRESS_PARSED, None)
            .await;
    }

    // ---- analyzing: pure derivations, recomputed on resume --------------
    let sections = build_enhanced_sections(&result.dashboard);
    let mut anomalies = detect_anomalies(
        &result.dashboard.top_api,
        AnomalyKind::SlowApi,
        ctx.config.anomaly_threshold,
    );
    anomalies.extend(detect_anomalies(
        &result.dashboard.top_sql,
        AnomalyKind::SlowSql,
        ctx.config.anomaly_threshold,
    ));

    if matches!(start_state, JobStatus::Parsing | JobStatus::Analyzing) {
        if result.dashboard.stats.total_lines > 0 {
            ctx.meta
                .set_total_lines(tenant_id, job_id, result.dashboard.stats.total_lines)
                .await?;
        }
        if !anomalies.is_empty() {
            with_retries("set_anomalies", || {
                ctx.meta.set_anomalies(tenant_id, job_id, &anomalies)
            })
            .await?;
        }
        if !ctx
            .meta
            .transition(tenant_id, job_id, JobStatus::Analyzing, JobStatus::Storing)
            .await?
        {
            return Ok(JobOutcome::Skipped);
        }
        ctx.meta
            .set_progress(tenant_id, job_id, PROGRESS_AGGREGATED)
            .await?;
        publish_progress(ctx, tenant_id, job_id, JobStatus::Storing, PROGRESS_AGGREGATED, None)
            .await;
    }
    if cancel.is_cancelled() {
        return Err(WorkerError::Cancelled);
    }

    // ---- storing: durable rows, cache artefacts, search segments --------
    let entries = extract_log_entries(tenant_id, job_id, &result, Utc::now());
    if !entries.is_empty() {
        let inserted =
            with_retries("insert_entries", || ctx.columnar.insert_entries(tenant_id, &entries))
                .await?;
        counter!("arlens_entries_inserted_total").increment(inserted);
    }

    cache_artifacts(ctx, tenant_id, job_id, &result.dashboard, &sections).await;

    let docs: Vec<LogDocument> = entries.iter().map(LogDocument::from).collect();
    ctx.search.index_job(job_id, &docs)?;
    ctx.search.commit()?;

    // ---- complete: exactly one processor gets the terminal transition ---
    if ctx.meta.complete_job(tenant_id, job_id).await? {
        publish_progress(ctx, tenant_id, job_id, JobStatus::Complete, PROGRESS_COMPLETE, None)
            .await;
        counter!("arlens_jobs_completed_total").increment(1);
        info!(%tenant_id, %job_id, entries = entries.len(), "job complete");
        Ok(JobOutcome::Completed)
    } else {
        debug!(%job_id, "job already terminal, skipping completion");
        Ok(JobOutcome::Skipped)
    }
}

/// Persist the failure and emit a best-effort terminal event.
async fn fail_job(ctx: &WorkerContext, tenant_id: Uuid, job_id: Uuid, reason: &str) {
    match ctx.meta.fail_job(tenant_id, job_id, reason).await {
        Ok(true) => {
            publish_progress(
                ctx,
                tenant_id,
                job_id,
                JobStatus::Failed,
                0,
                Some(reason.to_string()),
            )
            .await;
            counter!("arlens_jobs_failed_total").increment(1);
        }
        Ok(false) => debug!(%job_id, "job already terminal, failure not recorded"),
        Err(err) => error!(%tenant_id, %job_id, error = %err, "could not persist job failure"),
    }
}

/// Progress publishes never block or fail the processor.
async fn publish_progress(
    ctx: &WorkerContext,
    tenant_id: Uuid,
    job_id: Uuid,
    status: JobStatus,
    percent: u8,
    note: Option<String>,
) {
    let event = ProgressEvent::new(tenant_id, job_id, status, percent, note);
    if let Err(err) = ctx.bus.publish_progress(&event).await {
        warn!(%job_id, error = %err, "progress publish failed, dropping event");
    }
}

/// Cache writes are best-effort: the authoritative data is in the columnar
/// store, so failures are logged and swallowed.
async fn cache_artifacts(
    ctx: &WorkerContext,
    tenant_id: Uuid,
    job_id: Uuid,
    dashboard: &DashboardData,
    sections: &EnhancedSections,
) {
    let artefacts = [
        ("dashboard", serde_json::to_string(dashboard)),
        ("aggregates", serde_json::to_string(&sections.aggregates)),
        ("exceptions", serde_json::to_string(&sections.exceptions)),
        ("threads", serde_json::to_string(&sections.threads)),
        ("filters", serde_json::to_string(&sections.filters)),
        ("gaps", serde_json::to_string(&sections.gaps)),
    ];
    for (section, payload) in artefacts {
        let json = match payload {
            Ok(json) => json,
            Err(err) => {
                warn!(section, error = %err, "artefact encoding failed, skipping");
                continue;
            }
        };
        if let Err(err) = ctx
            .cache
            .put_section(tenant_id, job_id, section, &json, ctx.config.cache_ttl)
            .await
        {
            warn!(section, error = %err, "cache write failed, continuing");
        }
    }
}
