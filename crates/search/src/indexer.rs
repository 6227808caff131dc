// crates/search/src/indexer.rs
use tantivy::doc;
use tantivy::Term;
use tracing::{debug, info};
use uuid::Uuid;

use arlens_core::LogEntry;

use crate::{SearchError, SearchIndex};

/// A document to be indexed in Tantivy, representing one log entry.
pub struct LogDocument {
    pub tenant_id: String,
    pub job_id: String,
    pub entry_id: String,
    pub line_no: u64,
    pub log_type: String,
    pub user: String,
    pub form: String,
    pub queue: String,
    /// "true" / "false" for qualifier matching.
    pub success: String,
    /// Full-text content: raw line text plus the error message, if any.
    pub content: String,
    /// Unix timestamp in seconds. 0 if unknown.
    pub timestamp: i64,
    pub duration_ms: u64,
}

impl From<&LogEntry> for LogDocument {
    fn from(entry: &LogEntry) -> Self {
        let mut content = entry.raw.clone();
        for extra in [
            entry.sql_statement.as_deref(),
            entry.filter_name.as_deref(),
            entry.escalation_name.as_deref(),
            entry.error_message.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            if !content.contains(extra) {
                if !content.is_empty() {
                    content.push(' ');
                }
                content.push_str(extra);
            }
        }
        Self {
            tenant_id: entry.tenant_id.to_string(),
            job_id: entry.job_id.to_string(),
            entry_id: entry.entry_id.to_string(),
            line_no: entry.line_no,
            log_type: entry.log_type.as_str().to_string(),
            user: entry.user.clone(),
            form: entry.form.clone().unwrap_or_default(),
            queue: entry.queue.clone(),
            success: entry.success.to_string(),
            content,
            timestamp: entry.timestamp.timestamp(),
            duration_ms: entry.duration_ms,
        }
    }
}

impl SearchIndex {
    /// Index all documents for a job. Deletes any existing documents for
    /// this job_id first, then adds the new ones (re-ingest idempotency).
    /// Does NOT commit — call `commit()` after indexing a batch.
    pub fn index_job(&self, job_id: Uuid, docs: &[LogDocument]) -> Result<(), SearchError> {
        let writer = self.writer.lock().map_err(|e| {
            SearchError::Io(std::io::Error::other(format!("writer lock poisoned: {e}")))
        })?;

        let delete_term = Term::from_field_text(self.job_id_field, &job_id.to_string());
        writer.delete_term(delete_term);

        for doc_data in docs {
            writer.add_document(doc!(
                self.tenant_id_field => doc_data.tenant_id.as_str(),
                self.job_id_field => doc_data.job_id.as_str(),
                self.entry_id_field => doc_data.entry_id.as_str(),
                self.line_no_field => doc_data.line_no,
                self.log_type_field => doc_data.log_type.as_str(),
                self.user_field => doc_data.user.as_str(),
                self.form_field => doc_data.form.as_str(),
                self.queue_field => doc_data.queue.as_str(),
                self.success_field => doc_data.success.as_str(),
                self.content_field => doc_data.content.as_str(),
                self.timestamp_field => doc_data.timestamp,
                self.duration_ms_field => doc_data.duration_ms,
            ))?;
        }

        debug!(
            job_id = %job_id,
            doc_count = docs.len(),
            "indexed job documents"
        );

        Ok(())
    }

    /// Delete all documents for a given job_id. Does NOT commit.
    pub fn delete_job(&self, job_id: Uuid) -> Result<(), SearchError> {
        let writer = self.writer.lock().map_err(|e| {
            SearchError::Io(std::io::Error::other(format!("writer lock poisoned: {e}")))
        })?;

        let delete_term = Term::from_field_text(self.job_id_field, &job_id.to_string());
        writer.delete_term(delete_term);

        debug!(job_id = %job_id, "deleted job from search index");

        Ok(())
    }

    /// Commit all pending writes (inserts and deletes) to disk.
    pub fn commit(&self) -> Result<(), SearchError> {
        let mut writer = self.writer.lock().map_err(|e| {
            SearchError::Io(std::io::Error::other(format!("writer lock poisoned: {e}")))
        })?;

        writer.commit()?;
        info!("search index committed");

        Ok(())
    }
}
