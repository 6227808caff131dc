// crates/core/src/entries.rs
//! Mapping from a decoded parse result to durable log-entry rows.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{LogEntry, LogType, ParseResult, TopEntry};

/// Flatten every Top-N list of a parse result into columnar log entries,
/// ordered by line number.
///
/// Queued API calls are API-typed rows; their queue column records the
/// admission queue they waited in. Rows whose table had no parseable
/// timestamp fall back to `extracted_at` so month partitioning stays sane.
pub fn extract_log_entries(
    tenant_id: Uuid,
    job_id: Uuid,
    result: &ParseResult,
    extracted_at: DateTime<Utc>,
) -> Vec<LogEntry> {
    let dashboard = &result.dashboard;
    let mut entries = Vec::with_capacity(
        dashboard.top_api.len()
            + dashboard.top_sql.len()
            + dashboard.top_filters.len()
            + dashboard.top_escalations.len()
            + dashboard.queued_api.len(),
    );

    for entry in &dashboard.top_api {
        entries.push(base_entry(tenant_id, job_id, entry, LogType::Api, extracted_at));
    }
    for entry in &dashboard.queued_api {
        entries.push(base_entry(tenant_id, job_id, entry, LogType::Api, extracted_at));
    }
    for entry in &dashboard.top_sql {
        let mut row = base_entry(tenant_id, job_id, entry, LogType::Sql, extracted_at);
        // The analyzer reports the table name in the form column for SQL
        // rows; the identifier carries the statement.
        row.form = None;
        row.table_name = non_empty(&entry.form);
        row.sql_statement = non_empty(&entry.identifier);
        entries.push(row);
    }
    for entry in &dashboard.top_filters {
        let mut row = base_entry(tenant_id, job_id, entry, LogType::Filter, extracted_at);
        row.filter_name = non_empty(&entry.identifier);
        row.filter_operation = non_empty(&entry.details);
        entries.push(row);
    }
    for entry in &dashboard.top_escalations {
        let mut row = base_entry(tenant_id, job_id, entry, LogType::Escalation, extracted_at);
        row.escalation_name = non_empty(&entry.identifier);
        row.escalation_pool = non_empty(&entry.queue);
        entries.push(row);
    }

    entries.sort_by_key(|e| e.line_no);
    entries
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

fn base_entry(
    tenant_id: Uuid,
    job_id: Uuid,
    entry: &TopEntry,
    log_type: LogType,
    extracted_at: DateTime<Utc>,
) -> LogEntry {
    LogEntry {
        tenant_id,
        job_id,
        entry_id: Uuid::new_v4(),
        line_no: entry.line_no,
        timestamp: entry.timestamp.unwrap_or(extracted_at),
        log_type,
        trace_id: entry.rpc.clone(),
        rpc_id: entry.rpc.clone(),
        thread_id: entry.thread.clone(),
        queue: entry.queue.clone(),
        user: entry.user.clone(),
        duration_ms: entry.duration_ms,
        success: entry.success,
        form: if log_type == LogType::Api {
            non_empty(&entry.form)
        } else {
            None
        },
        table_name: None,
        sql_statement: None,
        filter_name: None,
        filter_operation: None,
        escalation_name: None,
        escalation_pool: None,
        raw: entry.details.clone(),
        error_message: if entry.success {
            None
        } else {
            non_empty(&entry.details)
        },
    }
}
