// crates/search/src/lib.rs
//! Full-text index over ingested log entries.
//!
//! Uses Tantivy (embedded Rust search engine) as the opaque indexer behind
//! the pipeline: the job processor inserts one document per log entry, and
//! the query side runs BM25-ranked content search with qualifier filters.
//! Every query carries the tenant as a mandatory first filter.
//!
//! # Architecture
//!
//! - **Schema**: 12 fields per document (see `build_schema`)
//! - **Write path**: `indexer::LogDocument` -> `SearchIndex::index_job` -> `commit`
//! - **Read path**: `SearchIndex::search` -> qualifier parsing -> BooleanQuery

pub mod indexer;
pub mod query;

use std::path::Path;
use std::sync::Mutex;

use tantivy::schema::{Field, Schema, FAST, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy};

pub use indexer::LogDocument;
pub use query::{EntryHit, SearchResponse};

/// Schema version for the Tantivy index. Bump when the schema changes;
/// a mismatch wipes and rebuilds the index directory.
pub const SEARCH_SCHEMA_VERSION: u32 = 1;

/// Errors that can occur during search operations.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("Query parse error: {0}")]
    QueryParse(#[from] tantivy::query::QueryParserError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the Tantivy schema for log-entry documents.
///
/// Fields:
/// - `tenant_id`: STRING | STORED — mandatory filter on every query
/// - `job_id`: STRING | STORED — exact match, delete-by-job
/// - `entry_id`: STRING | STORED — row identity
/// - `line_no`: u64, FAST | STORED — display and sorting
/// - `log_type`: STRING | STORED — qualifier filter (`type:sql`)
/// - `user`: STRING | STORED — qualifier filter (`user:appadmin`)
/// - `form`: STRING | STORED — qualifier filter (`form:HPD:Help Desk`)
/// - `queue`: STRING | STORED — qualifier filter (`queue:Fast`)
/// - `success`: STRING | STORED — qualifier filter (`success:false`)
/// - `content`: TEXT | STORED — full-text BM25 search
/// - `timestamp`: i64, FAST | STORED — range queries, sorting
/// - `duration_ms`: u64, FAST | STORED — display
pub fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();

    schema_builder.add_text_field("tenant_id", STRING | STORED);
    schema_builder.add_text_field("job_id", STRING | STORED);
    schema_builder.add_text_field("entry_id", STRING | STORED);
    schema_builder.add_u64_field("line_no", FAST | STORED);
    schema_builder.add_text_field("log_type", STRING | STORED);
    schema_builder.add_text_field("user", STRING | STORED);
    schema_builder.add_text_field("form", STRING | STORED);
    schema_builder.add_text_field("queue", STRING | STORED);
    schema_builder.add_text_field("success", STRING | STORED);
    schema_builder.add_text_field("content", TEXT | STORED);
    schema_builder.add_i64_field("timestamp", FAST | STORED);
    schema_builder.add_u64_field("duration_ms", FAST | STORED);

    schema_builder.build()
}

/// The main search index, holding a Tantivy index, reader, writer, and
/// pre-resolved field handles.
pub struct SearchIndex {
    pub index: Index,
    /// Reader for executing queries. Automatically reloads on commit.
    pub reader: IndexReader,
    /// Writer for indexing documents. Wrapped in Mutex because `IndexWriter`
    /// requires `&mut self` but may be used from different async contexts.
    pub writer: Mutex<IndexWriter>,
    pub schema: Schema,

    pub(crate) tenant_id_field: Field,
    pub(crate) job_id_field: Field,
    pub(crate) entry_id_field: Field,
    pub(crate) line_no_field: Field,
    pub(crate) log_type_field: Field,
    pub(crate) user_field: Field,
    pub(crate) form_field: Field,
    pub(crate) queue_field: Field,
    pub(crate) success_field: Field,
    pub(crate) content_field: Field,
    pub(crate) timestamp_field: Field,
    pub(crate) duration_ms_field: Field,
}

impl SearchIndex {
    /// Open or create a Tantivy index at the given directory path.
    ///
    /// Schema versioning: if a `schema_version` file exists and does not
    /// match [`SEARCH_SCHEMA_VERSION`], the directory is wiped and the
    /// index rebuilt from scratch.
    pub fn open(path: &Path) -> Result<Self, SearchError> {
        std::fs::create_dir_all(path)?;

        let version_path = path.join("schema_version");
        let needs_rebuild = match std::fs::read_to_string(&version_path) {
            Ok(v) => v.trim().parse::<u32>().unwrap_or(0) != SEARCH_SCHEMA_VERSION,
            Err(_) => false, // no version file = first creation, not a rebuild
        };

        if needs_rebuild {
            tracing::info!(
                path = %path.display(),
                "search schema version mismatch — rebuilding index"
            );
            if let Ok(entries) = std::fs::read_dir(path) {
                for entry in entries.flatten() {
                    let p = entry.path();
                    if p.file_name().map(|n| n != "schema_version").unwrap_or(false) {
                        if p.is_dir() {
                            let _ = std::fs::remove_dir_all(&p);
                        } else {
                            let _ = std::fs::remove_file(&p);
                        }
                    }
                }
            }
        }

        let schema = build_schema();

        let index = match Index::open_in_dir(path) {
            Ok(idx) => {
                tracing::info!(path = %path.display(), "opened existing search index");
                idx
            }
            Err(_) => {
                tracing::info!(path = %path.display(), "creating new search index");
                Index::create_in_dir(path, schema.clone())?
            }
        };

        let _ = std::fs::write(&version_path, format!("{}", SEARCH_SCHEMA_VERSION));

        Self::from_index(index, schema)
    }

    /// Create a Tantivy index entirely in RAM. Useful for tests.
    pub fn open_in_ram() -> Result<Self, SearchError> {
        let schema = build_schema();
        let index = Index::create_in_ram(schema.clone());
        Self::from_index(index, schema)
    }

    fn from_index(index: Index, schema: Schema) -> Result<Self, SearchError> {
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;

        // 50MB writer heap — reasonable for batch indexing
        let writer = index.writer(50_000_000)?;

        let field = |name: &str| {
            schema
                .get_field(name)
                .unwrap_or_else(|_| panic!("schema missing {name} field"))
        };

        Ok(Self {
            tenant_id_field: field("tenant_id"),
            job_id_field: field("job_id"),
            entry_id_field: field("entry_id"),
            line_no_field: field("line_no"),
            log_type_field: field("log_type"),
            user_field: field("user"),
            form_field: field("form"),
            queue_field: field("queue"),
            success_field: field("success"),
            content_field: field("content"),
            timestamp_field: field("timestamp"),
            duration_ms_field: field("duration_ms"),
            index,
            reader,
            writer: Mutex::new(writer),
            schema,
        })
    }
}
