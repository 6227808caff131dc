// crates/db/src/columnar.rs
//! ClickHouse-backed columnar store for durable log entries.
//!
//! Entries are partitioned by tenant and month and ordered by
//! `(tenant_id, job_id, line_no)`. Inserts go out in batches of at most
//! [`MAX_INSERT_BATCH`] rows with the column ordering fixed by
//! [`EntryRow`]; every query template puts tenant equality first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use arlens_core::{LogEntry, LogType};

use crate::{ColumnarStore, DbError, DbResult, EntryQuery};

const COMPONENT: &str = "clickhouse";

/// Upper bound on rows per insert batch.
pub const MAX_INSERT_BATCH: usize = 10_000;

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS log_entries (
    tenant_id        UUID,
    job_id           UUID,
    entry_id         UUID,
    line_no          UInt64,
    timestamp        DateTime64(3, 'UTC'),
    log_type         LowCardinality(String),
    trace_id         String,
    rpc_id           String,
    thread_id        String,
    queue            String,
    user             String,
    duration_ms      UInt64,
    success          Bool,
    form             Nullable(String),
    table_name       Nullable(String),
    sql_statement    Nullable(String),
    filter_name      Nullable(String),
    filter_operation Nullable(String),
    escalation_name  Nullable(String),
    escalation_pool  Nullable(String),
    raw              String,
    error_message    Nullable(String)
)
ENGINE = ReplacingMergeTree
PARTITION BY (tenant_id, toYYYYMM(timestamp))
ORDER BY (tenant_id, job_id, line_no, log_type, rpc_id)
"#;

/// Wire row; field order is the insert column order.
#[derive(Debug, Row, Serialize, Deserialize)]
struct EntryRow {
    #[serde(with = "clickhouse::serde::uuid")]
    tenant_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    job_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    entry_id: Uuid,
    line_no: u64,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    timestamp: DateTime<Utc>,
    log_type: String,
    trace_id: String,
    rpc_id: String,
    thread_id: String,
    queue: String,
    user: String,
    duration_ms: u64,
    success: bool,
    form: Option<String>,
    table_name: Option<String>,
    sql_statement: Option<String>,
    filter_name: Option<String>,
    filter_operation: Option<String>,
    escalation_name: Option<String>,
    escalation_pool: Option<String>,
    raw: String,
    error_message: Option<String>,
}

impl From<&LogEntry> for EntryRow {
    fn from(entry: &LogEntry) -> Self {
        Self {
            tenant_id: entry.tenant_id,
            job_id: entry.job_id,
            entry_id: entry.entry_id,
            line_no: entry.line_no,
            timestamp: entry.timestamp,
            log_type: entry.log_type.as_str().to_string(),
            trace_id: entry.trace_id.clone(),
            rpc_id: entry.rpc_id.clone(),
            thread_id: entry.thread_id.clone(),
            queue: entry.queue.clone(),
            user: entry.user.clone(),
            duration_ms: entry.duration_ms,
            success: entry.success,
            form: entry.form.clone(),
            table_name: entry.table_name.clone(),
            sql_statement: entry.sql_statement.clone(),
            filter_name: entry.filter_name.clone(),
            filter_operation: entry.filter_operation.clone(),
            escalation_name: entry.escalation_name.clone(),
            escalation_pool: entry.escalation_pool.clone(),
            raw: entry.raw.clone(),
            error_message: entry.error_message.clone(),
        }
    }
}

impl EntryRow {
    fn into_entry(self) -> DbResult<LogEntry> {
        let log_type = LogType::parse(&self.log_type).ok_or_else(|| {
            DbError::permanent(COMPONENT, format!("bad log type {}", self.log_type))
        })?;
        Ok(LogEntry {
            tenant_id: self.tenant_id,
            job_id: self.job_id,
            entry_id: self.entry_id,
            line_no: self.line_no,
            timestamp: self.timestamp,
            log_type,
            trace_id: self.trace_id,
            rpc_id: self.rpc_id,
            thread_id: self.thread_id,
            queue: self.queue,
            user: self.user,
            duration_ms: self.duration_ms,
            success: self.success,
            form: self.form,
            table_name: self.table_name,
            sql_statement: self.sql_statement,
            filter_name: self.filter_name,
            filter_operation: self.filter_operation,
            escalation_name: self.escalation_name,
            escalation_pool: self.escalation_pool,
            raw: self.raw,
            error_message: self.error_message,
        })
    }
}

fn classify(err: clickhouse::error::Error) -> DbError {
    use clickhouse::error::Error;
    match err {
        Error::Network(_) => DbError::transient(COMPONENT, err),
        other => DbError::permanent(COMPONENT, other),
    }
}

/// Columnar store over a shared ClickHouse HTTP client.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
}

impl ClickHouseStore {
    /// Connect and ensure the `log_entries` table exists.
    pub async fn connect(url: &str, database: &str) -> DbResult<Self> {
        let client = Client::default().with_url(url).with_database(database);
        let store = Self { client };
        store
            .client
            .query(DDL)
            .execute()
            .await
            .map_err(classify)?;
        info!("clickhouse columnar store ready");
        Ok(store)
    }
}

#[async_trait]
impl ColumnarStore for ClickHouseStore {
    async fn insert_entries(&self, tenant_id: Uuid, entries: &[LogEntry]) -> DbResult<u64> {
        let mut written = 0u64;
        for chunk in entries.chunks(MAX_INSERT_BATCH) {
            let mut insert = self
                .client
                .insert::<EntryRow>("log_entries")
                .await
                .map_err(classify)?;
            for entry in chunk {
                if entry.tenant_id != tenant_id {
                    return Err(DbError::permanent(
                        COMPONENT,
                        format!("entry tenant {} does not match {tenant_id}", entry.tenant_id),
                    ));
                }
                insert.write(&EntryRow::from(entry)).await.map_err(classify)?;
            }
            insert.end().await.map_err(classify)?;
            written += chunk.len() as u64;
            debug!(batch = chunk.len(), written, "inserted log entry batch");
        }
        Ok(written)
    }

    async fn query_entries(&self, tenant_id: Uuid, query: &EntryQuery) -> DbResult<Vec<LogEntry>> {
        // Tenant equality is always the first predicate.
        let mut sql = String::from("SELECT ?fields FROM log_entries WHERE tenant_id = ?");

        if query.job_id.is_some() {
            sql.push_str(" AND job_id = ?");
        }
        if query.from.is_some() {
            sql.push_str(" AND timestamp >= fromUnixTimestamp64Milli(?)");
        }
        if query.to.is_some() {
            sql.push_str(" AND timestamp < fromUnixTimestamp64Milli(?)");
        }
        if query.log_type.is_some() {
            sql.push_str(" AND log_type = ?");
        }
        if query.success.is_some() {
            sql.push_str(" AND success = ?");
        }
        if query.min_duration_ms.is_some() {
            sql.push_str(" AND duration_ms >= ?");
        }
        if query.max_duration_ms.is_some() {
            sql.push_str(" AND duration_ms <= ?");
        }
        if query.user.is_some() {
            sql.push_str(" AND user = ?");
        }
        if query.queue.is_some() {
            sql.push_str(" AND queue = ?");
        }
        if query.form.is_some() {
            sql.push_str(" AND form = ?");
        }
        if query.table_name.is_some() {
            sql.push_str(" AND table_name = ?");
        }
        if query.filter_name.is_some() {
            sql.push_str(" AND filter_name = ?");
        }
        if query.escalation_name.is_some() {
            sql.push_str(" AND escalation_name = ?");
        }
        sql.push_str(" ORDER BY line_no");
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = self.client.query(&sql).bind(tenant_id);
        if let Some(job_id) = query.job_id {
            q = q.bind(job_id);
        }
        if let Some(from) = query.from {
            q = q.bind(from.timestamp_millis());
        }
        if let Some(to) = query.to {
            q = q.bind(to.timestamp_millis());
        }
        if let Some(log_type) = query.log_type {
            q = q.bind(log_type.as_str());
        }
        if let Some(success) = query.success {
            q = q.bind(success);
        }
        if let Some(min) = query.min_duration_ms {
            q = q.bind(min);
        }
        if let Some(max) = query.max_duration_ms {
            q = q.bind(max);
        }
        if let Some(user) = &query.user {
            q = q.bind(user.as_str());
        }
        if let Some(queue) = &query.queue {
            q = q.bind(queue.as_str());
        }
        if let Some(form) = &query.form {
            q = q.bind(form.as_str());
        }
        if let Some(table_name) = &query.table_name {
            q = q.bind(table_name.as_str());
        }
        if let Some(filter_name) = &query.filter_name {
            q = q.bind(filter_name.as_str());
        }
        if let Some(escalation_name) = &query.escalation_name {
            q = q.bind(escalation_name.as_str());
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit);
        }

        let rows: Vec<EntryRow> = q.fetch_all().await.map_err(classify)?;
        rows.into_iter().map(EntryRow::into_entry).collect()
    }
}
