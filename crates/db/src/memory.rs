// crates/db/src/memory.rs
//! In-memory store doubles.
//!
//! Every gateway trait has an in-memory implementation with the same
//! tenant-isolation and conditional-transition semantics as the production
//! stores, so the job pipeline and state machine are testable without any
//! infrastructure. `MemoryMetadataStore` additionally records the status
//! history of every job for transition-ordering assertions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use arlens_core::{
    AnalysisJob, Anomaly, JobStatus, LogEntry, LogFile, SavedSearch, SearchHistoryEntry,
};

use crate::{
    cache_key, ArtifactCache, BlobStore, ColumnarStore, DbError, DbResult, EntryQuery,
    MetadataStore,
};

const COMPONENT: &str = "memory";

/// In-memory [`MetadataStore`].
#[derive(Default)]
pub struct MemoryMetadataStore {
    files: Mutex<HashMap<Uuid, LogFile>>,
    jobs: Mutex<HashMap<Uuid, AnalysisJob>>,
    history: Mutex<HashMap<Uuid, Vec<JobStatus>>>,
    saved: Mutex<Vec<SavedSearch>>,
    searches: Mutex<Vec<SearchHistoryEntry>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status transitions recorded for a job, in order (initial status
    /// included at creation).
    pub fn status_history(&self, job_id: Uuid) -> Vec<JobStatus> {
        self.history
            .lock()
            .expect("history lock")
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, job_id: Uuid, status: JobStatus) {
        self.history
            .lock()
            .expect("history lock")
            .entry(job_id)
            .or_default()
            .push(status);
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_file(&self, file: &LogFile) -> DbResult<()> {
        self.files
            .lock()
            .expect("files lock")
            .insert(file.id, file.clone());
        Ok(())
    }

    async fn get_file(&self, tenant_id: Uuid, file_id: Uuid) -> DbResult<LogFile> {
        self.files
            .lock()
            .expect("files lock")
            .get(&file_id)
            .filter(|f| f.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| DbError::not_found(COMPONENT, format!("file {file_id}")))
    }

    async fn create_job(&self, job: &AnalysisJob) -> DbResult<()> {
        self.jobs
            .lock()
            .expect("jobs lock")
            .insert(job.id, job.clone());
        self.record(job.id, job.status);
        Ok(())
    }

    async fn get_job(&self, tenant_id: Uuid, job_id: Uuid) -> DbResult<AnalysisJob> {
        self.jobs
            .lock()
            .expect("jobs lock")
            .get(&job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| DbError::not_found(COMPONENT, format!("job {job_id}")))
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
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let Some(job) = jobs.get_mut(&job_id).filter(|j| j.tenant_id == tenant_id) else {
            return Err(DbError::not_found(COMPONENT, format!("job {job_id}")));
        };
        if job.status != from {
            return Ok(false);
        }
        job.status = to;
        job.updated_at = Utc::now();
        drop(jobs);
        self.record(job_id, to);
        Ok(true)
    }

    async fn set_progress(&self, tenant_id: Uuid, job_id: Uuid, percent: u8) -> DbResult<()> {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let job = jobs
            .get_mut(&job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .ok_or_else(|| DbError::not_found(COMPONENT, format!("job {job_id}")))?;
        job.progress = percent;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_total_lines(&self, tenant_id: Uuid, job_id: Uuid, lines: u64) -> DbResult<()> {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let job = jobs
            .get_mut(&job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .ok_or_else(|| DbError::not_found(COMPONENT, format!("job {job_id}")))?;
        job.total_lines = Some(lines);
        Ok(())
    }

    async fn set_anomalies(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        anomalies: &[Anomaly],
    ) -> DbResult<()> {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let job = jobs
            .get_mut(&job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .ok_or_else(|| DbError::not_found(COMPONENT, format!("job {job_id}")))?;
        job.anomalies = anomalies.to_vec();
        Ok(())
    }

    async fn complete_job(&self, tenant_id: Uuid, job_id: Uuid) -> DbResult<bool> {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let Some(job) = jobs.get_mut(&job_id).filter(|j| j.tenant_id == tenant_id) else {
            return Err(DbError::not_found(COMPONENT, format!("job {job_id}")));
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Complete;
        job.progress = 100;
        job.error = None;
        job.completed_at = Some(Utc::now());
        job.updated_at = Utc::now();
        drop(jobs);
        self.record(job_id, JobStatus::Complete);
        Ok(true)
    }

    async fn fail_job(&self, tenant_id: Uuid, job_id: Uuid, reason: &str) -> DbResult<bool> {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        let Some(job) = jobs.get_mut(&job_id).filter(|j| j.tenant_id == tenant_id) else {
            return Err(DbError::not_found(COMPONENT, format!("job {job_id}")));
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.error = Some(reason.to_string());
        job.completed_at = Some(Utc::now());
        job.updated_at = Utc::now();
        drop(jobs);
        self.record(job_id, JobStatus::Failed);
        Ok(true)
    }

    async fn save_search(&self, search: &SavedSearch) -> DbResult<()> {
        self.saved.lock().expect("saved lock").push(search.clone());
        Ok(())
    }

    async fn list_saved_searches(
        &self,
        tenant_id: Uuid,
        user_id: &str,
    ) -> DbResult<Vec<SavedSearch>> {
        Ok(self
            .saved
            .lock()
            .expect("saved lock")
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete_saved_search(&self, tenant_id: Uuid, search_id: Uuid) -> DbResult<bool> {
        let mut saved = self.saved.lock().expect("saved lock");
        let before = saved.len();
        saved.retain(|s| !(s.tenant_id == tenant_id && s.id == search_id));
        Ok(saved.len() != before)
    }

    async fn record_search(&self, entry: &SearchHistoryEntry) -> DbResult<()> {
        self.searches
            .lock()
            .expect("searches lock")
            .push(entry.clone());
        Ok(())
    }

    async fn list_search_history(
        &self,
        tenant_id: Uuid,
        user_id: &str,
        limit: u32,
    ) -> DbResult<Vec<SearchHistoryEntry>> {
        let mut entries: Vec<SearchHistoryEntry> = self
            .searches
            .lock()
            .expect("searches lock")
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        entries.truncate(limit as usize);
        Ok(entries)
    }
}

/// In-memory [`ColumnarStore`].
#[derive(Default)]
pub struct MemoryColumnarStore {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryColumnarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("entries lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ColumnarStore for MemoryColumnarStore {
    async fn insert_entries(&self, tenant_id: Uuid, entries: &[LogEntry]) -> DbResult<u64> {
        for entry in entries {
            if entry.tenant_id != tenant_id {
                return Err(DbError::permanent(
                    COMPONENT,
                    format!("entry tenant {} does not match {tenant_id}", entry.tenant_id),
                ));
            }
        }
        self.entries
            .lock()
            .expect("entries lock")
            .extend_from_slice(entries);
        Ok(entries.len() as u64)
    }

    async fn query_entries(&self, tenant_id: Uuid, query: &EntryQuery) -> DbResult<Vec<LogEntry>> {
        let entries = self.entries.lock().expect("entries lock");
        let mut matched: Vec<LogEntry> = entries
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .filter(|e| query.job_id.map_or(true, |id| e.job_id == id))
            .filter(|e| query.from.map_or(true, |t| e.timestamp >= t))
            .filter(|e| query.to.map_or(true, |t| e.timestamp < t))
            .filter(|e| query.log_type.map_or(true, |t| e.log_type == t))
            .filter(|e| query.success.map_or(true, |s| e.success == s))
            .filter(|e| query.min_duration_ms.map_or(true, |d| e.duration_ms >= d))
            .filter(|e| query.max_duration_ms.map_or(true, |d| e.duration_ms <= d))
            .filter(|e| query.user.as_deref().map_or(true, |u| e.user == u))
            .filter(|e| query.queue.as_deref().map_or(true, |q| e.queue == q))
            .filter(|e| query.form.as_deref().map_or(true, |f| e.form.as_deref() == Some(f)))
            .filter(|e| {
                query
                    .table_name
                    .as_deref()
                    .map_or(true, |t| e.table_name.as_deref() == Some(t))
            })
            .filter(|e| {
                query
                    .filter_name
                    .as_deref()
                    .map_or(true, |f| e.filter_name.as_deref() == Some(f))
            })
            .filter(|e| {
                query
                    .escalation_name
                    .as_deref()
                    .map_or(true, |n| e.escalation_name.as_deref() == Some(n))
            })
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.line_no);
        if let Some(limit) = query.limit {
            matched.truncate(limit as usize);
        }
        Ok(matched)
    }
}

/// In-memory [`BlobStore`].
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> DbResult<()> {
        self.objects
            .lock()
            .expect("objects lock")
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> DbResult<Vec<u8>> {
        self.objects
            .lock()
            .expect("objects lock")
            .get(key)
            .cloned()
            .ok_or_else(|| DbError::not_found(COMPONENT, key.to_string()))
    }
}

/// In-memory [`ArtifactCache`] honouring TTLs.
#[derive(Default)]
pub struct MemoryCache {
    values: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values
            .lock()
            .expect("values lock")
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ArtifactCache for MemoryCache {
    async fn put_section(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        section: &str,
        payload: &str,
        ttl: Duration,
    ) -> DbResult<()> {
        let key = cache_key(tenant_id, job_id, section);
        let expires = Instant::now().checked_add(ttl);
        self.values
            .lock()
            .expect("values lock")
            .insert(key, (payload.to_string(), expires));
        Ok(())
    }

    async fn get_section(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        section: &str,
    ) -> DbResult<Option<String>> {
        let key = cache_key(tenant_id, job_id, section);
        let values = self.values.lock().expect("values lock");
        Ok(values
            .get(&key)
            .filter(|(_, expires)| expires.map_or(true, |at| Instant::now() < at))
            .map(|(payload, _)| payload.clone()))
    }
}
