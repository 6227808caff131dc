// crates/db/src/lib.rs
//! Tenant-scoped storage gateway over four heterogeneous stores.
//!
//! Each store is a capability trait (`MetadataStore`, `ColumnarStore`,
//! `BlobStore`, `ArtifactCache`) with one production implementation and an
//! in-memory double in [`memory`] so that pipeline tests never need real
//! infrastructure. Every operation takes the tenant explicitly; no
//! connection ever caches a tenant context.

pub mod blob;
pub mod cache;
pub mod columnar;
pub mod memory;
pub mod postgres;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use arlens_core::{
    AnalysisJob, Anomaly, JobStatus, LogEntry, LogFile, LogType, SavedSearch, SearchHistoryEntry,
};

pub use blob::{object_key, S3BlobStore, S3Config};
pub use cache::{cache_key, RedisCache, DEFAULT_CACHE_TTL};
pub use columnar::{ClickHouseStore, MAX_INSERT_BATCH};
pub use postgres::PgMetadataStore;
pub use retry::with_retries;

/// Storage errors, classified for retry decisions.
///
/// `Transient` errors may be retried by the caller ([`with_retries`]);
/// `Permanent` and `NotFound` must not be.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("transient {component} error: {message}")]
    Transient {
        component: &'static str,
        message: String,
    },

    #[error("{component} error: {message}")]
    Permanent {
        component: &'static str,
        message: String,
    },

    #[error("{component}: {what} not found")]
    NotFound {
        component: &'static str,
        what: String,
    },
}

impl DbError {
    pub fn transient(component: &'static str, err: impl std::fmt::Display) -> Self {
        DbError::Transient {
            component,
            message: err.to_string(),
        }
    }

    pub fn permanent(component: &'static str, err: impl std::fmt::Display) -> Self {
        DbError::Permanent {
            component,
            message: err.to_string(),
        }
    }

    pub fn not_found(component: &'static str, what: impl Into<String>) -> Self {
        DbError::NotFound {
            component,
            what: what.into(),
        }
    }

    /// True for errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Transient { .. })
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Relational job/file metadata, tenant-isolated by row-level security.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_file(&self, file: &LogFile) -> DbResult<()>;
    async fn get_file(&self, tenant_id: Uuid, file_id: Uuid) -> DbResult<LogFile>;

    async fn create_job(&self, job: &AnalysisJob) -> DbResult<()>;
    async fn get_job(&self, tenant_id: Uuid, job_id: Uuid) -> DbResult<AnalysisJob>;

    /// Atomic conditional `queued → parsing` transition. Exactly one caller
    /// observes `true` for a given queued job; everyone else gets `false`.
    async fn claim_job(&self, tenant_id: Uuid, job_id: Uuid) -> DbResult<bool>;

    /// Conditional transition from `from` to `to`. Returns `false` when the
    /// job was not in `from` (e.g. a concurrent processor advanced it).
    async fn transition(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    ) -> DbResult<bool>;

    async fn set_progress(&self, tenant_id: Uuid, job_id: Uuid, percent: u8) -> DbResult<()>;
    async fn set_total_lines(&self, tenant_id: Uuid, job_id: Uuid, lines: u64) -> DbResult<()>;
    async fn set_anomalies(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        anomalies: &[Anomaly],
    ) -> DbResult<()>;

    /// Terminal transition to `complete`. Returns `false` when the job was
    /// already terminal (at-most-once completion).
    async fn complete_job(&self, tenant_id: Uuid, job_id: Uuid) -> DbResult<bool>;

    /// Terminal transition to `failed` with a short human-readable reason.
    /// Returns `false` when the job was already terminal.
    async fn fail_job(&self, tenant_id: Uuid, job_id: Uuid, reason: &str) -> DbResult<bool>;

    async fn save_search(&self, search: &SavedSearch) -> DbResult<()>;
    async fn list_saved_searches(
        &self,
        tenant_id: Uuid,
        user_id: &str,
    ) -> DbResult<Vec<SavedSearch>>;
    async fn delete_saved_search(&self, tenant_id: Uuid, search_id: Uuid) -> DbResult<bool>;

    async fn record_search(&self, entry: &SearchHistoryEntry) -> DbResult<()>;
    async fn list_search_history(
        &self,
        tenant_id: Uuid,
        user_id: &str,
        limit: u32,
    ) -> DbResult<Vec<SearchHistoryEntry>>;
}

/// Structured predicates for a columnar range scan. The tenant is passed
/// separately and is always the first predicate in the generated query.
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    pub job_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub log_type: Option<LogType>,
    pub success: Option<bool>,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub user: Option<String>,
    pub queue: Option<String>,
    pub form: Option<String>,
    pub table_name: Option<String>,
    pub filter_name: Option<String>,
    pub escalation_name: Option<String>,
    pub limit: Option<u64>,
}

/// Analytical column store for durable log entries.
#[async_trait]
pub trait ColumnarStore: Send + Sync {
    /// Bulk insert in batches of at most [`MAX_INSERT_BATCH`] rows,
    /// preserving line-number order within each batch. Returns the number
    /// of rows written.
    async fn insert_entries(&self, tenant_id: Uuid, entries: &[LogEntry]) -> DbResult<u64>;

    async fn query_entries(&self, tenant_id: Uuid, query: &EntryQuery) -> DbResult<Vec<LogEntry>>;
}

/// S3-compatible object store for uploaded files.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> DbResult<()>;
    async fn get(&self, key: &str) -> DbResult<Vec<u8>>;
}

/// Tenant-prefixed key-value cache for dashboard artefacts.
///
/// A cache miss is never an error; writes are best-effort at the call site.
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    async fn put_section(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        section: &str,
        payload: &str,
        ttl: Duration,
    ) -> DbResult<()>;

    async fn get_section(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        section: &str,
    ) -> DbResult<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(DbError::transient("postgres", "connection reset").is_transient());
        assert!(!DbError::permanent("postgres", "unique violation").is_transient());
        assert!(!DbError::not_found("postgres", "job 42").is_transient());
    }

    #[test]
    fn test_error_display_carries_component() {
        let err = DbError::transient("clickhouse", "timeout");
        assert!(err.to_string().contains("clickhouse"));
        assert!(err.to_string().contains("timeout"));

        let err = DbError::not_found("postgres", "file abc");
        assert!(err.to_string().contains("file abc not found"));
    }
}
