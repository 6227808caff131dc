// crates/db/src/postgres.rs
//! Postgres-backed metadata store.
//!
//! Every operation runs inside a transaction that first sets
//! `app.tenant_id` via `set_config(..., true)`, so row-level-security
//! policies scope all queries to the calling tenant and the setting dies
//! with the transaction. Connections returned to the pool never carry a
//! tenant context.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use arlens_core::{
    AnalysisJob, Anomaly, JobStatus, LogFile, LogTypeHint, SavedSearch, SearchHistoryEntry,
};

use crate::{DbError, DbResult, MetadataStore};

const COMPONENT: &str = "postgres";

/// Inline migrations, applied in order and tracked in `_migrations`.
const MIGRATIONS: &[&str] = &[
    // 1: files + analysis_jobs with row-level security
    r#"
    CREATE TABLE IF NOT EXISTS files (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        filename TEXT NOT NULL,
        log_type_hint TEXT NOT NULL,
        size_bytes BIGINT NOT NULL,
        content_hash TEXT NOT NULL,
        object_key TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    ALTER TABLE files ENABLE ROW LEVEL SECURITY;
    DROP POLICY IF EXISTS files_tenant ON files;
    CREATE POLICY files_tenant ON files
        USING (tenant_id = current_setting('app.tenant_id')::uuid)
        WITH CHECK (tenant_id = current_setting('app.tenant_id')::uuid);

    CREATE TABLE IF NOT EXISTS analysis_jobs (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        file_id UUID NOT NULL REFERENCES files(id),
        status TEXT NOT NULL DEFAULT 'queued',
        heap_mb INTEGER NOT NULL DEFAULT 2048,
        progress INTEGER NOT NULL DEFAULT 0,
        total_lines BIGINT,
        error TEXT,
        anomalies TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        completed_at TIMESTAMPTZ
    );
    ALTER TABLE analysis_jobs ENABLE ROW LEVEL SECURITY;
    DROP POLICY IF EXISTS analysis_jobs_tenant ON analysis_jobs;
    CREATE POLICY analysis_jobs_tenant ON analysis_jobs
        USING (tenant_id = current_setting('app.tenant_id')::uuid)
        WITH CHECK (tenant_id = current_setting('app.tenant_id')::uuid);

    CREATE INDEX IF NOT EXISTS idx_jobs_tenant_status
        ON analysis_jobs (tenant_id, status);
    "#,
    // 2: saved searches + search history
    r#"
    CREATE TABLE IF NOT EXISTS saved_searches (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        query TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    ALTER TABLE saved_searches ENABLE ROW LEVEL SECURITY;
    DROP POLICY IF EXISTS saved_searches_tenant ON saved_searches;
    CREATE POLICY saved_searches_tenant ON saved_searches
        USING (tenant_id = current_setting('app.tenant_id')::uuid)
        WITH CHECK (tenant_id = current_setting('app.tenant_id')::uuid);

    CREATE TABLE IF NOT EXISTS search_history (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        user_id TEXT NOT NULL,
        query TEXT NOT NULL,
        executed_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    ALTER TABLE search_history ENABLE ROW LEVEL SECURITY;
    DROP POLICY IF EXISTS search_history_tenant ON search_history;
    CREATE POLICY search_history_tenant ON search_history
        USING (tenant_id = current_setting('app.tenant_id')::uuid)
        WITH CHECK (tenant_id = current_setting('app.tenant_id')::uuid);

    CREATE INDEX IF NOT EXISTS idx_search_history_tenant_user
        ON search_history (tenant_id, user_id, executed_at DESC);
    "#,
];

fn classify(err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::RowNotFound => DbError::not_found(COMPONENT, "row"),
        sqlx::Error::Io(e) => DbError::transient(COMPONENT, e),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            DbError::transient(COMPONENT, err)
        }
        other => DbError::permanent(COMPONENT, other),
    }
}

/// Metadata store over a shared Postgres pool.
#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Connect, sized to the per-process job concurrency, and apply
    /// migrations.
    pub async fn connect(url: &str, max_connections: u32) -> DbResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(classify)?;
        let store = Self { pool };
        store.run_migrations().await?;
        info!("postgres metadata store ready");
        Ok(store)
    }

    async fn run_migrations(&self) -> DbResult<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS version FROM _migrations")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        let current: i32 = row.get("version");

        for (i, migration) in MIGRATIONS.iter().enumerate() {
            let version = (i + 1) as i32;
            if version > current {
                sqlx::raw_sql(migration)
                    .execute(&self.pool)
                    .await
                    .map_err(classify)?;
                sqlx::query("INSERT INTO _migrations (version) VALUES ($1)")
                    .bind(version)
                    .execute(&self.pool)
                    .await
                    .map_err(classify)?;
                info!(version, "applied metadata migration");
            }
        }
        Ok(())
    }

    /// Open a transaction with the tenant context set. The `true` argument
    /// to `set_config` makes the setting transaction-local, so releasing
    /// the connection always clears it.
    async fn tenant_tx(&self, tenant_id: Uuid) -> DbResult<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        sqlx::query("SELECT set_config('app.tenant_id', $1, true)")
            .bind(tenant_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        Ok(tx)
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> DbResult<AnalysisJob> {
    let status_text: String = row.get("status");
    let status = JobStatus::parse(&status_text)
        .ok_or_else(|| DbError::permanent(COMPONENT, format!("bad job status {status_text}")))?;
    let anomalies: Option<String> = row.get("anomalies");
    let anomalies: Vec<Anomaly> = match anomalies {
        Some(text) => serde_json::from_str(&text).map_err(|e| DbError::permanent(COMPONENT, e))?,
        None => Vec::new(),
    };
    let total_lines: Option<i64> = row.get("total_lines");
    Ok(AnalysisJob {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        file_id: row.get("file_id"),
        status,
        heap_mb: row.get::<i32, _>("heap_mb") as u32,
        progress: row.get::<i32, _>("progress") as u8,
        total_lines: total_lines.map(|n| n as u64),
        error: row.get("error"),
        anomalies,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        completed_at: row.get("completed_at"),
    })
}

fn file_from_row(row: &sqlx::postgres::PgRow) -> DbResult<LogFile> {
    let hint_text: String = row.get("log_type_hint");
    let log_type_hint = LogTypeHint::parse(&hint_text)
        .ok_or_else(|| DbError::permanent(COMPONENT, format!("bad log type hint {hint_text}")))?;
    Ok(LogFile {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        filename: row.get("filename"),
        log_type_hint,
        size_bytes: row.get("size_bytes"),
        content_hash: row.get("content_hash"),
        object_key: row.get("object_key"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    })
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn create_file(&self, file: &LogFile) -> DbResult<()> {
        let mut tx = self.tenant_tx(file.tenant_id).await?;
        sqlx::query(
            "INSERT INTO files (id, tenant_id, filename, log_type_hint, size_bytes, \
             content_hash, object_key, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(file.id)
        .bind(file.tenant_id)
        .bind(&file.filename)
        .bind(file.log_type_hint.as_str())
        .bind(file.size_bytes)
        .bind(&file.content_hash)
        .bind(&file.object_key)
        .bind(file.created_at)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)
    }

    async fn get_file(&self, tenant_id: Uuid, file_id: Uuid) -> DbResult<LogFile> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let row = sqlx::query("SELECT * FROM files WHERE id = $1")
            .bind(file_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?
            .ok_or_else(|| DbError::not_found(COMPONENT, format!("file {file_id}")))?;
        let file = file_from_row(&row)?;
        tx.commit().await.map_err(classify)?;
        Ok(file)
    }

    async fn create_job(&self, job: &AnalysisJob) -> DbResult<()> {
        let mut tx = self.tenant_tx(job.tenant_id).await?;
        sqlx::query(
            "INSERT INTO analysis_jobs (id, tenant_id, file_id, status, heap_mb, progress, \
             created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(job.id)
        .bind(job.tenant_id)
        .bind(job.file_id)
        .bind(job.status.as_str())
        .bind(job.heap_mb as i32)
        .bind(job.progress as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)
    }

    async fn get_job(&self, tenant_id: Uuid, job_id: Uuid) -> DbResult<AnalysisJob> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let row = sqlx::query("SELECT * FROM analysis_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?
            .ok_or_else(|| DbError::not_found(COMPONENT, format!("job {job_id}")))?;
        let job = job_from_row(&row)?;
        tx.commit().await.map_err(classify)?;
        Ok(job)
    }

    async fn claim_job(&self, tenant_id: Uuid, job_id: Uuid) -> DbResult<bool> {
        self.transition(tenant_id, job_id, JobStatus::Queued, JobStatus::Parsing)
            .await
    }

    async fn transition(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    ) -> DbResult<bool> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let result = sqlx::query(
            "UPDATE analysis_jobs SET status = $1, updated_at = now() \
             WHERE id = $2 AND status = $3",
        )
        .bind(to.as_str())
        .bind(job_id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_progress(&self, tenant_id: Uuid, job_id: Uuid, percent: u8) -> DbResult<()> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        sqlx::query(
            "UPDATE analysis_jobs SET progress = $1, updated_at = now() WHERE id = $2",
        )
        .bind(percent as i32)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)
    }

    async fn set_total_lines(&self, tenant_id: Uuid, job_id: Uuid, lines: u64) -> DbResult<()> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        sqlx::query(
            "UPDATE analysis_jobs SET total_lines = $1, updated_at = now() WHERE id = $2",
        )
        .bind(lines as i64)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)
    }

    async fn set_anomalies(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        anomalies: &[Anomaly],
    ) -> DbResult<()> {
        let payload =
            serde_json::to_string(anomalies).map_err(|e| DbError::permanent(COMPONENT, e))?;
        let mut tx = self.tenant_tx(tenant_id).await?;
        sqlx::query(
            "UPDATE analysis_jobs SET anomalies = $1, updated_at = now() WHERE id = $2",
        )
        .bind(payload)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)
    }

    async fn complete_job(&self, tenant_id: Uuid, job_id: Uuid) -> DbResult<bool> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let result = sqlx::query(
            "UPDATE analysis_jobs SET status = 'complete', progress = 100, error = NULL, \
             completed_at = now(), updated_at = now() \
             WHERE id = $1 AND status NOT IN ('complete', 'failed')",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_job(&self, tenant_id: Uuid, job_id: Uuid, reason: &str) -> DbResult<bool> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let result = sqlx::query(
            "UPDATE analysis_jobs SET status = 'failed', error = $1, \
             completed_at = now(), updated_at = now() \
             WHERE id = $2 AND status NOT IN ('complete', 'failed')",
        )
        .bind(reason)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(result.rows_affected() == 1)
    }

    async fn save_search(&self, search: &SavedSearch) -> DbResult<()> {
        let mut tx = self.tenant_tx(search.tenant_id).await?;
        sqlx::query(
            "INSERT INTO saved_searches (id, tenant_id, user_id, name, query, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(search.id)
        .bind(search.tenant_id)
        .bind(&search.user_id)
        .bind(&search.name)
        .bind(&search.query)
        .bind(search.created_at)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)
    }

    async fn list_saved_searches(
        &self,
        tenant_id: Uuid,
        user_id: &str,
    ) -> DbResult<Vec<SavedSearch>> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let rows = sqlx::query(
            "SELECT * FROM saved_searches WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        rows.iter()
            .map(|row| {
                Ok(SavedSearch {
                    id: row.get("id"),
                    tenant_id: row.get("tenant_id"),
                    user_id: row.get("user_id"),
                    name: row.get("name"),
                    query: row.get("query"),
                    created_at: row.get::<DateTime<Utc>, _>("created_at"),
                })
            })
            .collect()
    }

    async fn delete_saved_search(&self, tenant_id: Uuid, search_id: Uuid) -> DbResult<bool> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let result = sqlx::query("DELETE FROM saved_searches WHERE id = $1")
            .bind(search_id)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_search(&self, entry: &SearchHistoryEntry) -> DbResult<()> {
        let mut tx = self.tenant_tx(entry.tenant_id).await?;
        sqlx::query(
            "INSERT INTO search_history (id, tenant_id, user_id, query, executed_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(&entry.user_id)
        .bind(&entry.query)
        .bind(entry.executed_at)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)
    }

    async fn list_search_history(
        &self,
        tenant_id: Uuid,
        user_id: &str,
        limit: u32,
    ) -> DbResult<Vec<SearchHistoryEntry>> {
        let mut tx = self.tenant_tx(tenant_id).await?;
        let rows = sqlx::query(
            "SELECT * FROM search_history WHERE user_id = $1 \
             ORDER BY executed_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        rows.iter()
            .map(|row| {
                Ok(SearchHistoryEntry {
                    id: row.get("id"),
                    tenant_id: row.get("tenant_id"),
                    user_id: row.get("user_id"),
                    query: row.get("query"),
                    executed_at: row.get::<DateTime<Utc>, _>("executed_at"),
                })
            })
            .collect()
    }
}
