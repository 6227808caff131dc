// crates/core/src/types.rs
//! Shared domain types: the decoded parse result, the derived report
//! sections, and the durable job/file/entry records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of an AR Server log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Api,
    Sql,
    Filter,
    Escalation,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Api => "api",
            LogType::Sql => "sql",
            LogType::Filter => "filter",
            LogType::Escalation => "escalation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api" => Some(LogType::Api),
            "sql" => Some(LogType::Sql),
            "filter" => Some(LogType::Filter),
            "escalation" => Some(LogType::Escalation),
            _ => None,
        }
    }
}

/// Log-type hint declared by the uploader for a whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTypeHint {
    Api,
    Sql,
    Filter,
    Escalation,
    Mixed,
}

impl LogTypeHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogTypeHint::Api => "api",
            LogTypeHint::Sql => "sql",
            LogTypeHint::Filter => "filter",
            LogTypeHint::Escalation => "escalation",
            LogTypeHint::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api" => Some(LogTypeHint::Api),
            "sql" => Some(LogTypeHint::Sql),
            "filter" => Some(LogTypeHint::Filter),
            "escalation" => Some(LogTypeHint::Escalation),
            "mixed" => Some(LogTypeHint::Mixed),
            _ => None,
        }
    }
}

/// Lifecycle state of an analysis job.
///
/// The only legal sequence is `Queued → Parsing → Analyzing → Storing →
/// Complete`, with `Failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Parsing,
    Analyzing,
    Storing,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Parsing => "parsing",
            JobStatus::Analyzing => "analyzing",
            JobStatus::Storing => "storing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "parsing" => Some(JobStatus::Parsing),
            "analyzing" => Some(JobStatus::Analyzing),
            "storing" => Some(JobStatus::Storing),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

/// An uploaded log artefact. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFile {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub filename: String,
    pub log_type_hint: LogTypeHint,
    pub size_bytes: i64,
    pub content_hash: String,
    pub object_key: String,
    pub created_at: DateTime<Utc>,
}

/// A request to process one [`LogFile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub file_id: Uuid,
    pub status: JobStatus,
    /// JVM heap ceiling for the analyzer subprocess, in MB.
    pub heap_mb: u32,
    /// Progress percent, 0..=100.
    pub progress: u8,
    pub total_lines: Option<u64>,
    pub error: Option<String>,
    pub anomalies: Vec<Anomaly>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row of a Top-N pipe table in the analyzer report.
///
/// `rank` is always the 1-based position in the emitted list; the rank
/// column in the source text is not trusted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopEntry {
    pub rank: u32,
    pub line_no: u64,
    pub file: u32,
    pub timestamp: Option<DateTime<Utc>>,
    pub thread: String,
    pub rpc: String,
    pub queue: String,
    pub identifier: String,
    pub form: String,
    pub user: String,
    pub duration_ms: u64,
    pub success: bool,
    pub details: String,
}

impl TopEntry {
    /// Correlation key for per-thread aggregation: the thread identifier
    /// when present, otherwise the trace (RPC) identifier.
    pub fn thread_key(&self) -> &str {
        if self.thread.is_empty() {
            &self.rpc
        } else {
            &self.thread
        }
    }
}

/// Scalar counters from the `General Statistics` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_lines: u64,
    pub api_calls: u64,
    pub sql_operations: u64,
    pub filter_executions: u64,
    pub escalation_operations: u64,
    pub unique_users: u64,
    pub unique_forms: u64,
    pub unique_tables: u64,
    pub unique_queues: u64,
    pub log_duration: String,
}

/// One time-series bucket (report order is preserved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBucket {
    pub timestamp: String,
    pub count: u64,
}

/// A categorical key → occurrence count mapping that preserves the order
/// keys first appeared in the report. Duplicate keys accumulate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution(pub Vec<(String, u64)>);

impl Distribution {
    pub fn add(&mut self, key: String, count: u64) {
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == key) {
            slot.1 += count;
        } else {
            self.0.push((key, count));
        }
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, u64)> {
        self.0.iter()
    }

    pub fn total(&self) -> u64 {
        self.0.iter().map(|(_, v)| v).sum()
    }
}

/// Named distributions decoded from the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distributions {
    pub threads: Distribution,
    pub users: Distribution,
    pub forms: Distribution,
    pub errors: Distribution,
}

/// Everything the dashboard renders, decoded from one analyzer report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    pub stats: DashboardStats,
    pub top_api: Vec<TopEntry>,
    pub top_sql: Vec<TopEntry>,
    pub top_filters: Vec<TopEntry>,
    pub top_escalations: Vec<TopEntry>,
    pub queued_api: Vec<TopEntry>,
    pub time_series: Vec<TimeBucket>,
    pub distributions: Distributions,
}

/// The structured product of decoding one analyzer report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseResult {
    pub dashboard: DashboardData,
}

// ---------------------------------------------------------------------------
// Enhanced sections (derived, see `enhance`)
// ---------------------------------------------------------------------------

/// Which Top-N list an aggregate report was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateSource {
    Api,
    Sql,
}

/// Field the aggregate report groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateGroupBy {
    Form,
    User,
    Table,
}

/// One group row (or the grand total) of an aggregate report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRow {
    pub key: String,
    pub count: u64,
    pub total_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
    pub error_count: u64,
    pub error_rate: f64,
    pub unique_traces: u64,
}

/// Grouped summary over one Top-N list, sorted by count descending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateReport {
    pub source: AggregateSource,
    pub group_by: AggregateGroupBy,
    pub groups: Vec<AggregateRow>,
    /// Absent when the source list is empty.
    pub grand_total: Option<AggregateRow>,
}

/// One error code rolled up from the `errors` distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionEntry {
    pub code: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Exception rollup, sorted by count descending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionReport {
    pub entries: Vec<ExceptionEntry>,
    /// First 10 codes of the sorted list.
    pub top_codes: Vec<String>,
    /// Per-log-type error rates in percent, e.g. `("api", 3.2)`.
    pub error_rates: Vec<(String, f64)>,
}

/// Per-thread utilisation, sorted by call count descending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStat {
    pub thread_id: String,
    pub calls: u64,
    pub total_ms: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
    pub error_count: u64,
    pub busy_percent: f64,
}

/// A filter name with its execution count and total time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MostExecutedFilter {
    pub name: String,
    pub count: u64,
    pub total_ms: u64,
}

/// Filter statistics for one transaction (keyed by RPC identifier).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFilterStats {
    pub rpc_id: String,
    pub filter_count: u64,
    pub total_ms: u64,
    pub filters_per_second: f64,
}

/// Filter complexity report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterComplexity {
    pub most_executed: Vec<MostExecutedFilter>,
    /// At most 100 entries, sorted by total time descending.
    pub per_transaction: Vec<TransactionFilterStats>,
    /// Populated by a post-ingest query; empty at build time.
    pub nesting_levels: Vec<(String, u64)>,
    pub total_filter_time_ms: u64,
}

/// Per-queue health summary, sorted by call count descending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub queue: String,
    pub calls: u64,
    pub total_ms: u64,
    pub avg_ms: f64,
    pub p95_ms: u64,
    pub error_count: u64,
}

/// A processing gap observed in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GapEntry {
    pub line_no: u64,
    pub thread: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Gap analysis: queue health plus gap entries (the latter populated by a
/// post-ingest query; empty at build time).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GapSummary {
    pub gaps: Vec<GapEntry>,
    pub queue_health: Vec<QueueHealth>,
}

/// All derived report sections for one parse result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedSections {
    pub aggregates: Vec<AggregateReport>,
    pub exceptions: ExceptionReport,
    pub threads: Vec<ThreadStat>,
    pub filters: FilterComplexity,
    pub gaps: GapSummary,
}

// ---------------------------------------------------------------------------
// Anomalies
// ---------------------------------------------------------------------------

/// Kind of statistical anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyKind {
    SlowApi,
    SlowSql,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::SlowApi => "SlowAPI",
            AnomalyKind::SlowSql => "SlowSQL",
        }
    }
}

/// One statistical outlier detected over a Top-N duration list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub title: String,
    pub description: String,
    pub identifier: String,
    pub value_ms: u64,
    pub sigma: f64,
}

// ---------------------------------------------------------------------------
// Durable log entries
// ---------------------------------------------------------------------------

/// One durable row in the columnar store. Immutable; partitioned by tenant
/// and month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub tenant_id: Uuid,
    pub job_id: Uuid,
    pub entry_id: Uuid,
    pub line_no: u64,
    pub timestamp: DateTime<Utc>,
    pub log_type: LogType,
    pub trace_id: String,
    pub rpc_id: String,
    pub thread_id: String,
    pub queue: String,
    pub user: String,
    pub duration_ms: u64,
    pub success: bool,
    pub form: Option<String>,
    pub table_name: Option<String>,
    pub sql_statement: Option<String>,
    pub filter_name: Option<String>,
    pub filter_operation: Option<String>,
    pub escalation_name: Option<String>,
    pub escalation_pool: Option<String>,
    pub raw: String,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Auxiliary user-scoped entities
// ---------------------------------------------------------------------------

/// A named, reusable search query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSearch {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: String,
    pub name: String,
    pub query: String,
    pub created_at: DateTime<Utc>,
}

/// One executed search, recorded for recall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHistoryEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: String,
    pub query: String,
    pub executed_at: DateTime<Utc>,
}
