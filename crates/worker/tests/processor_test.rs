// Pipeline tests over in-memory store doubles: state-machine ordering,
// at-most-once completion, crash resume, retry/backoff, timeout, and
// tenant isolation, all without real infrastructure.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use arlens_bus::{JobBus, JobSubmitMessage, MemoryBus};
use arlens_core::{AnalysisJob, JobStatus, LogFile, LogTypeHint};
use arlens_db::memory::{MemoryBlobStore, MemoryCache, MemoryColumnarStore, MemoryMetadataStore};
use arlens_db::{
    ArtifactCache, BlobStore, ColumnarStore, DbError, DbResult, EntryQuery, MetadataStore,
};
use arlens_search::SearchIndex;
use arlens_worker::{
    process_job, Analyzer, AnalyzerError, JobOutcome, ProcessorConfig, WorkerContext, WorkerError,
};

// One failed API call, one extreme outlier (z ≈ 3.02 over the 11 calls),
// colon-embedded form keys, and every section kind the decoder knows.
const REPORT: &str = "\
=== General Statistics ===
Total Lines Processed: 5,000
API Calls: 11
SQL Operations: 2
Filter Executions: 2
Escalation Operations: 1
Unique Users: 3
Unique Forms: 2
Unique Tables: 1
Log Duration: 1h 30m

=== Top API Calls ===
| Rank | Line# | Timestamp | Thread | RPC | Queue | Identifier | Form | User | Duration(ms) | Status | Details |
|------|-------|-----------|--------|-----|-------|------------|------|------|--------------|--------|---------|
| 1 | 100 | 2024-01-15 10:00:00 | 1148 | 3001 | Fast | GLEWF | HPD:Help Desk | appadmin | 50000 | OK | slow schema fetch |
| 2 | 110 | 2024-01-15 10:00:05 | 1148 | 3002 | Fast | GLE | HPD:Help Desk | appadmin | 100 | OK | |
| 3 | 120 | 2024-01-15 10:00:10 | 1149 | 3003 | Fast | GLE | HPD:Help Desk | appadmin | 100 | OK | |
| 4 | 130 | 2024-01-15 10:00:15 | 1149 | 3004 | List | GLE | CTM:People | bob | 100 | OK | |
| 5 | 140 | 2024-01-15 10:00:20 | 1149 | 3005 | List | GLE | CTM:People | bob | 100 | OK | |
| 6 | 150 | 2024-01-15 10:00:25 | 1150 | 3006 | Fast | SE | HPD:Help Desk | carol | 100 | Failed | ERROR (302): Entry does not exist |
| 7 | 160 | 2024-01-15 10:00:30 | 1150 | 3007 | Fast | GLE | HPD:Help Desk | carol | 100 | OK | |
| 8 | 170 | 2024-01-15 10:00:35 | 1150 | 3008 | Fast | GLE | HPD:Help Desk | carol | 100 | OK | |
| 9 | 180 | 2024-01-15 10:00:40 | 1151 | 3009 | List | GLE | CTM:People | bob | 100 | OK | |
| 10 | 190 | 2024-01-15 10:00:45 | 1151 | 3010 | Fast | GLE | HPD:Help Desk | appadmin | 100 | OK | |
| 11 | 200 | 2024-01-15 10:00:50 | 1151 | 3011 | Fast | GLE | HPD:Help Desk | appadmin | 100 | OK | |

=== Top SQL Statements ===
| Rank | Line# | Thread | RPC | Identifier | Form | User | Duration(ms) | Status |
|------|-------|--------|-----|------------|------|------|--------------|--------|
| 1 | 105 | 1148 | 3001 | SELECT schemaid FROM arschema | arschema | appadmin | 4200 | OK |
| 2 | 115 | 1148 | 3002 | SELECT * FROM T100 | T100 | appadmin | 300 | OK |

=== Top Filter Executions ===
| Rank | Line# | RPC | Identifier | Duration(ms) | Status | Details |
|------|-------|-----|------------|--------------|--------|---------|
| 1 | 125 | 3003 | HPD:INC:SetStatus | 120 | OK | Push Fields |
| 2 | 135 | 3003 | HPD:INC:Notify | 80 | OK | Notify |

=== Top Escalation Executions ===
| Rank | Line# | Queue | Identifier | Duration(ms) | Status |
|------|-------|-------|------------|--------------|--------|
| 1 | 145 | Pool-1 | Nightly Sweep | 900 | OK |

=== Queued API Calls ===
| Rank | Line# | Queue | Identifier | User | Duration(ms) | Status |
|------|-------|-------|------------|------|--------------|--------|
| 1 | 155 | Fast | GLEWF | appadmin | 1500 | OK |

=== Thread Distribution ===
1148: 3
1149: 3
1150: 3
1151: 3

=== User Distribution ===
appadmin: 6
bob: 3
carol: 2

=== Form Statistics ===
HPD:Help Desk: 8
CTM:People: 3

=== Exception Distribution ===
ERROR (302): Entry does not exist: 1

=== Hourly Activity ===
2024-01-15 10:00: 11
";

struct StaticAnalyzer {
    report: String,
}

#[async_trait]
impl Analyzer for StaticAnalyzer {
    async fn run(
        &self,
        _input: &Path,
        _heap_mb: u32,
        _cancel: &CancellationToken,
    ) -> Result<String, AnalyzerError> {
        Ok(self.report.clone())
    }
}

struct FailingAnalyzer;

#[async_trait]
impl Analyzer for FailingAnalyzer {
    async fn run(
        &self,
        _input: &Path,
        _heap_mb: u32,
        _cancel: &CancellationToken,
    ) -> Result<String, AnalyzerError> {
        Err(AnalyzerError::Failed {
            detail: "OutOfMemoryError: Java heap space".to_string(),
        })
    }
}

struct StuckAnalyzer;

#[async_trait]
impl Analyzer for StuckAnalyzer {
    async fn run(
        &self,
        _input: &Path,
        _heap_mb: u32,
        _cancel: &CancellationToken,
    ) -> Result<String, AnalyzerError> {
        tokio::time::sleep(Duration::from_secs(7200)).await;
        Ok(String::new())
    }
}

/// Blob store that fails transiently N times before delegating.
struct FlakyBlobStore {
    inner: MemoryBlobStore,
    remaining_failures: AtomicU32,
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> DbResult<()> {
        self.inner.put(key, bytes).await
    }

    async fn get(&self, key: &str) -> DbResult<Vec<u8>> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(DbError::transient("s3", "connection reset by peer"));
        }
        self.inner.get(key).await
    }
}

struct Harness {
    meta: Arc<MemoryMetadataStore>,
    columnar: Arc<MemoryColumnarStore>,
    cache: Arc<MemoryCache>,
    bus: Arc<MemoryBus>,
    search: Arc<SearchIndex>,
    ctx: WorkerContext,
    tenant_id: Uuid,
    job_id: Uuid,
}

impl Harness {
    async fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        let blob = Arc::new(MemoryBlobStore::new());
        Self::with_blob(analyzer, blob).await
    }

    async fn with_blob(analyzer: Arc<dyn Analyzer>, blob: Arc<dyn BlobStore>) -> Self {
        let meta = Arc::new(MemoryMetadataStore::new());
        let columnar = Arc::new(MemoryColumnarStore::new());
        let cache = Arc::new(MemoryCache::new());
        let bus = Arc::new(MemoryBus::new());
        let search = Arc::new(SearchIndex::open_in_ram().unwrap());

        let tenant_id = Uuid::new_v4();
        let (file, job) = seed_rows(&*meta, &*blob, tenant_id).await;
        let _ = file;

        let ctx = WorkerContext {
            meta: meta.clone(),
            columnar: columnar.clone(),
            blob,
            cache: cache.clone(),
            bus: bus.clone(),
            search: search.clone(),
            analyzer,
            config: ProcessorConfig {
                anomaly_threshold: 3.0,
                cache_ttl: Duration::from_secs(300),
                job_timeout: Duration::from_secs(1800),
            },
        };

        Self {
            meta,
            columnar,
            cache,
            bus,
            search,
            ctx,
            tenant_id,
            job_id: job.id,
        }
    }

    fn message(&self) -> JobSubmitMessage {
        JobSubmitMessage {
            job_id: self.job_id,
            tenant_id: self.tenant_id,
        }
    }
}

async fn seed_rows(
    meta: &dyn MetadataStore,
    blob: &dyn BlobStore,
    tenant_id: Uuid,
) -> (LogFile, AnalysisJob) {
    let file_id = Uuid::new_v4();
    let object_key = arlens_db::object_key(tenant_id, file_id, "arapi.log");
    blob.put(&object_key, b"raw log bytes".to_vec()).await.unwrap();

    let file = LogFile {
        id: file_id,
        tenant_id,
        filename: "arapi.log".to_string(),
        log_type_hint: LogTypeHint::Mixed,
        size_bytes: 13,
        content_hash: "deadbeef".to_string(),
        object_key,
        created_at: Utc::now(),
    };
    meta.create_file(&file).await.unwrap();

    let job = AnalysisJob {
        id: Uuid::new_v4(),
        tenant_id,
        file_id,
        status: JobStatus::Queued,
        heap_mb: 2048,
        progress: 0,
        total_lines: None,
        error: None,
        anomalies: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        completed_at: None,
    };
    meta.create_job(&job).await.unwrap();
    (file, job)
}

fn static_analyzer() -> Arc<dyn Analyzer> {
    Arc::new(StaticAnalyzer {
        report: REPORT.to_string(),
    })
}

#[tokio::test]
async fn test_happy_path_reaches_complete() {
    let harness = Harness::new(static_analyzer()).await;

    let outcome = process_job(
        &harness.ctx,
        &harness.message(),
        false,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Completed);

    let job = harness
        .meta
        .get_job(harness.tenant_id, harness.job_id)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.progress, 100);
    assert!(job.completed_at.is_some());
    assert_eq!(job.total_lines, Some(5000));
    assert!(job.error.is_none());

    // The 50 s outlier over the clustered API durations is an anomaly.
    assert_eq!(job.anomalies.len(), 1);
    assert_eq!(job.anomalies[0].identifier, "GLEWF");
    assert!(job.anomalies[0].sigma > 3.0);

    // 11 API + 1 queued + 2 SQL + 2 filters + 1 escalation.
    let entries = harness
        .columnar
        .query_entries(harness.tenant_id, &EntryQuery::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 17);
    assert!(entries.windows(2).all(|w| w[0].line_no <= w[1].line_no));

    // Dashboard plus every derived section cached.
    let mut keys = harness.cache.keys();
    keys.sort();
    assert_eq!(keys.len(), 6);
    for section in ["dashboard", "aggregates", "exceptions", "threads", "filters", "gaps"] {
        assert!(
            harness
                .cache
                .get_section(harness.tenant_id, harness.job_id, section)
                .await
                .unwrap()
                .is_some(),
            "missing cached section {section}"
        );
    }

    // Entries are searchable.
    harness.search.reader.reload().unwrap();
    let found = harness
        .search
        .search(harness.tenant_id, "arschema", 10, 0)
        .unwrap();
    assert_eq!(found.total_matches, 1);
}

#[tokio::test]
async fn test_status_sequence_is_the_legal_prefix() {
    let harness = Harness::new(static_analyzer()).await;
    process_job(
        &harness.ctx,
        &harness.message(),
        false,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(
        harness.meta.status_history(harness.job_id),
        vec![
            JobStatus::Queued,
            JobStatus::Parsing,
            JobStatus::Analyzing,
            JobStatus::Storing,
            JobStatus::Complete,
        ]
    );
}

#[tokio::test]
async fn test_progress_events_in_order() {
    let harness = Harness::new(static_analyzer()).await;
    let mut progress = harness
        .bus
        .subscribe_progress(harness.tenant_id, harness.job_id)
        .await
        .unwrap();

    process_job(
        &harness.ctx,
        &harness.message(),
        false,
        CancellationToken::new(),
    )
    .await;

    let mut events = Vec::new();
    for _ in 0..4 {
        events.push(progress.next().await.unwrap());
    }
    let percents: Vec<u8> = events.iter().map(|e| e.percent).collect();
    assert_eq!(percents, vec![5, 40, 60, 100]);
    let statuses: Vec<&str> = events.iter().map(|e| e.status.as_str()).collect();
    assert_eq!(statuses, vec!["parsing", "analyzing", "storing", "complete"]);
}

#[tokio::test]
async fn test_at_most_once_completion_under_contention() {
    let harness = Harness::new(static_analyzer()).await;
    let message = harness.message();

    let (a, b) = tokio::join!(
        process_job(&harness.ctx, &message, false, CancellationToken::new()),
        process_job(&harness.ctx, &message, false, CancellationToken::new()),
    );

    let outcomes = [a, b];
    assert_eq!(
        outcomes.iter().filter(|o| **o == JobOutcome::Completed).count(),
        1,
        "exactly one processor completes: {outcomes:?}"
    );
    assert_eq!(
        outcomes.iter().filter(|o| **o == JobOutcome::Skipped).count(),
        1,
        "the loser exits without side effects: {outcomes:?}"
    );

    let history = harness.meta.status_history(harness.job_id);
    assert_eq!(
        history
            .iter()
            .filter(|s| **s == JobStatus::Complete)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_parser_failure_fails_job_without_rows() {
    let harness = Harness::new(Arc::new(FailingAnalyzer)).await;

    let outcome = process_job(
        &harness.ctx,
        &harness.message(),
        false,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Failed);

    let job = harness
        .meta
        .get_job(harness.tenant_id, harness.job_id)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert!(error.starts_with("ParserFailed"), "{error}");
    assert!(error.contains("OutOfMemoryError"));

    assert!(harness.columnar.is_empty());
    assert!(harness.cache.keys().is_empty());
}

#[tokio::test]
async fn test_empty_report_fails_as_decode_error() {
    let harness = Harness::new(Arc::new(StaticAnalyzer {
        report: "   \n\t\n".to_string(),
    }))
    .await;

    let outcome = process_job(
        &harness.ctx,
        &harness.message(),
        false,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Failed);

    let job = harness
        .meta
        .get_job(harness.tenant_id, harness.job_id)
        .await
        .unwrap();
    assert!(job.error.unwrap().contains("decode failed"));
}

#[tokio::test]
async fn test_crash_resume_from_analyzing() {
    let harness = Harness::new(static_analyzer()).await;

    // Simulate a worker that died after persisting `analyzing`.
    assert!(harness
        .meta
        .claim_job(harness.tenant_id, harness.job_id)
        .await
        .unwrap());
    assert!(harness
        .meta
        .transition(
            harness.tenant_id,
            harness.job_id,
            JobStatus::Parsing,
            JobStatus::Analyzing
        )
        .await
        .unwrap());

    // The bus redelivers the unacked message to a fresh worker.
    let outcome = process_job(
        &harness.ctx,
        &harness.message(),
        true,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Completed);

    assert_eq!(
        harness.meta.status_history(harness.job_id),
        vec![
            JobStatus::Queued,
            JobStatus::Parsing,
            JobStatus::Analyzing,
            JobStatus::Storing,
            JobStatus::Complete,
        ]
    );
}

#[tokio::test]
async fn test_first_delivery_duplicate_skips_in_flight_job() {
    let harness = Harness::new(static_analyzer()).await;

    // Another processor holds the job in `parsing`.
    assert!(harness
        .meta
        .claim_job(harness.tenant_id, harness.job_id)
        .await
        .unwrap());

    let outcome = process_job(
        &harness.ctx,
        &harness.message(),
        false,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Skipped);

    let job = harness
        .meta
        .get_job(harness.tenant_id, harness.job_id)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Parsing);
    assert!(harness.columnar.is_empty());
}

#[tokio::test]
async fn test_redelivery_for_terminal_job_skips() {
    let harness = Harness::new(static_analyzer()).await;
    process_job(
        &harness.ctx,
        &harness.message(),
        false,
        CancellationToken::new(),
    )
    .await;
    let before = harness.columnar.len();

    let outcome = process_job(
        &harness.ctx,
        &harness.message(),
        true,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Skipped);
    assert_eq!(harness.columnar.len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_wall_clock_timeout_fails_job() {
    let mut harness = Harness::new(Arc::new(StuckAnalyzer)).await;
    harness.ctx.config.job_timeout = Duration::from_secs(60);

    let outcome = process_job(
        &harness.ctx,
        &harness.message(),
        false,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Failed);

    let job = harness
        .meta
        .get_job(harness.tenant_id, harness.job_id)
        .await
        .unwrap();
    assert_eq!(job.error.as_deref(), Some("JobTimeout"));
}

#[tokio::test]
async fn test_cancellation_fails_job_with_reason() {
    let harness = Harness::new(static_analyzer()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = process_job(&harness.ctx, &harness.message(), false, cancel).await;
    assert_eq!(outcome, JobOutcome::Failed);

    let job = harness
        .meta
        .get_job(harness.tenant_id, harness.job_id)
        .await
        .unwrap();
    assert_eq!(job.error.as_deref(), Some("Cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_blob_errors_are_retried() {
    let blob = Arc::new(FlakyBlobStore {
        inner: MemoryBlobStore::new(),
        remaining_failures: AtomicU32::new(2),
    });
    let harness = Harness::with_blob(static_analyzer(), blob).await;

    let outcome = process_job(
        &harness.ctx,
        &harness.message(),
        false,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_transient_exhaustion_fails_job() {
    let blob = Arc::new(FlakyBlobStore {
        inner: MemoryBlobStore::new(),
        remaining_failures: AtomicU32::new(u32::MAX),
    });
    let harness = Harness::with_blob(static_analyzer(), blob).await;

    let outcome = process_job(
        &harness.ctx,
        &harness.message(),
        false,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Failed);

    let job = harness
        .meta
        .get_job(harness.tenant_id, harness.job_id)
        .await
        .unwrap();
    assert!(job.error.unwrap().contains("storage failed"));
}

#[tokio::test]
async fn test_tenant_isolation_across_the_whole_pipeline() {
    let harness_a = Harness::new(static_analyzer()).await;

    // A second tenant processed through the same shared stores.
    let scratch_blob = MemoryBlobStore::new();
    let (file_b, job_b) = seed_rows(&*harness_a.meta, &scratch_blob, Uuid::new_v4()).await;
    // Stage tenant B's blob in the harness's shared blob store.
    harness_a
        .ctx
        .blob
        .put(&file_b.object_key, b"raw log bytes".to_vec())
        .await
        .unwrap();

    process_job(
        &harness_a.ctx,
        &harness_a.message(),
        false,
        CancellationToken::new(),
    )
    .await;
    process_job(
        &harness_a.ctx,
        &JobSubmitMessage {
            job_id: job_b.id,
            tenant_id: job_b.tenant_id,
        },
        false,
        CancellationToken::new(),
    )
    .await;

    // Columnar scans never cross tenants.
    let rows_a = harness_a
        .ctx
        .columnar
        .query_entries(harness_a.tenant_id, &EntryQuery::default())
        .await
        .unwrap();
    assert!(!rows_a.is_empty());
    assert!(rows_a.iter().all(|e| e.tenant_id == harness_a.tenant_id));

    let rows_b = harness_a
        .ctx
        .columnar
        .query_entries(job_b.tenant_id, &EntryQuery::default())
        .await
        .unwrap();
    assert!(!rows_b.is_empty());
    assert!(rows_b.iter().all(|e| e.tenant_id == job_b.tenant_id));

    // Search carries the tenant as a mandatory predicate.
    harness_a.search.reader.reload().unwrap();
    let hits_a = harness_a
        .search
        .search(harness_a.tenant_id, "arschema", 10, 0)
        .unwrap();
    let hits_b = harness_a
        .search
        .search(job_b.tenant_id, "arschema", 10, 0)
        .unwrap();
    assert_eq!(hits_a.total_matches, 1);
    assert_eq!(hits_b.total_matches, 1);
    assert_ne!(hits_a.hits[0].job_id, hits_b.hits[0].job_id);

    // Metadata reads under the wrong tenant context find nothing.
    assert!(harness_a
        .meta
        .get_job(job_b.tenant_id, harness_a.job_id)
        .await
        .is_err());
}

#[test]
fn test_short_reasons() {
    assert_eq!(
        WorkerError::Analyzer(AnalyzerError::Timeout { secs: 1800 }).short_reason(),
        "ParserTimeout"
    );
    assert_eq!(WorkerError::Cancelled.short_reason(), "Cancelled");
    assert!(WorkerError::Analyzer(AnalyzerError::Failed {
        detail: "boom".into()
    })
    .short_reason()
    .starts_with("ParserFailed"));
}
