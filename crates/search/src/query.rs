// crates/search/src/query.rs
use std::time::Instant;

use serde::Serialize;
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::schema::Value;
use tantivy::{TantivyDocument, Term};
use tracing::debug;
use uuid::Uuid;

use crate::{SearchError, SearchIndex};

/// One matching log entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryHit {
    pub job_id: String,
    pub entry_id: String,
    pub line_no: u64,
    pub log_type: String,
    pub user: String,
    pub form: String,
    pub queue: String,
    pub content: String,
    pub timestamp: i64,
    pub duration_ms: u64,
    pub score: f32,
}

/// Result of one search call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub total_matches: usize,
    pub elapsed_ms: f64,
    pub hits: Vec<EntryHit>,
}

/// A parsed qualifier extracted from the query string.
#[derive(Debug, Clone)]
struct Qualifier {
    key: String,
    value: String,
}

/// Parse a raw query string into text query + qualifiers.
///
/// Qualifiers are `key:value` pairs. Supported keys:
/// `type`, `user`, `form`, `queue`, `success`, `job`.
/// Everything that is not a qualifier becomes the text query.
fn parse_query_string(raw: &str) -> (String, Vec<Qualifier>) {
    let mut qualifiers = Vec::new();
    let mut text_parts = Vec::new();

    let known_keys = ["type", "user", "form", "queue", "success", "job"];

    for token in tokenize_query(raw) {
        if let Some(colon_pos) = token.find(':') {
            let key = &token[..colon_pos];
            let value = &token[colon_pos + 1..];
            if known_keys.contains(&key) && !value.is_empty() {
                qualifiers.push(Qualifier {
                    key: key.to_string(),
                    value: value.trim_matches('"').to_string(),
                });
                continue;
            }
        }
        text_parts.push(token);
    }

    (text_parts.join(" "), qualifiers)
}

/// Tokenize a query string, preserving quoted phrases as single tokens.
fn tokenize_query(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();
    let mut current = String::new();

    while let Some(&ch) = chars.peek() {
        match ch {
            '"' => {
                chars.next();
                let mut phrase = String::from("\"");
                loop {
                    match chars.next() {
                        Some('"') => {
                            phrase.push('"');
                            break;
                        }
                        Some(c) => phrase.push(c),
                        None => {
                            // Unterminated quote — treat as regular text
                            phrase.push('"');
                            break;
                        }
                    }
                }
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(phrase);
            }
            ' ' | '\t' => {
                chars.next();
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => {
                chars.next();
                current.push(ch);
            }
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

impl SearchIndex {
    /// Execute a full-text search scoped to one tenant.
    ///
    /// - `tenant_id`: mandatory; the tenant term is the first query clause
    ///   and no document outside the tenant can ever match.
    /// - `query_str`: raw query, may contain qualifiers like `type:sql`
    ///   and quoted phrases.
    /// - `limit` / `offset`: pagination over ranked hits.
    pub fn search(
        &self,
        tenant_id: Uuid,
        query_str: &str,
        limit: usize,
        offset: usize,
    ) -> Result<SearchResponse, SearchError> {
        let start = Instant::now();
        let (text_query, qualifiers) = parse_query_string(query_str);

        if text_query.trim().is_empty() && qualifiers.is_empty() {
            return Ok(SearchResponse {
                query: query_str.to_string(),
                total_matches: 0,
                elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
                hits: vec![],
            });
        }

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        // Tenant isolation: always the first clause.
        clauses.push((
            Occur::Must,
            Box::new(TermQuery::new(
                Term::from_field_text(self.tenant_id_field, &tenant_id.to_string()),
                IndexRecordOption::Basic,
            )),
        ));

        for qualifier in &qualifiers {
            let field = match qualifier.key.as_str() {
                "type" => self.log_type_field,
                "user" => self.user_field,
                "form" => self.form_field,
                "queue" => self.queue_field,
                "success" => self.success_field,
                "job" => self.job_id_field,
                _ => continue,
            };
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(field, &qualifier.value),
                    IndexRecordOption::Basic,
                )),
            ));
        }

        if !text_query.trim().is_empty() {
            let parser = QueryParser::for_index(&self.index, vec![self.content_field]);
            let content_query = parser.parse_query(&text_query)?;
            clauses.push((Occur::Must, content_query));
        }

        let query = BooleanQuery::new(clauses);
        let searcher = self.reader.searcher();
        let (top_docs, total_matches) = searcher.search(
            &query,
            &(TopDocs::with_limit(limit).and_offset(offset), Count),
        )?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_addr) in top_docs {
            let retrieved: TantivyDocument = searcher.doc(doc_addr)?;
            let text = |field| {
                retrieved
                    .get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            hits.push(EntryHit {
                job_id: text(self.job_id_field),
                entry_id: text(self.entry_id_field),
                line_no: retrieved
                    .get_first(self.line_no_field)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                log_type: text(self.log_type_field),
                user: text(self.user_field),
                form: text(self.form_field),
                queue: text(self.queue_field),
                content: text(self.content_field),
                timestamp: retrieved
                    .get_first(self.timestamp_field)
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
                duration_ms: retrieved
                    .get_first(self.duration_ms_field)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                score,
            });
        }

        debug!(
            query = query_str,
            total_matches,
            returned = hits.len(),
            "search executed"
        );

        Ok(SearchResponse {
            query: query_str.to_string(),
            total_matches,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            hits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(
        tenant: Uuid,
        job: Uuid,
        line_no: u64,
        log_type: &str,
        user: &str,
        content: &str,
    ) -> crate::LogDocument {
        crate::LogDocument {
            tenant_id: tenant.to_string(),
            job_id: job.to_string(),
            entry_id: Uuid::new_v4().to_string(),
            line_no,
            log_type: log_type.to_string(),
            user: user.to_string(),
            form: String::new(),
            queue: String::new(),
            success: "true".to_string(),
            content: content.to_string(),
            timestamp: 1_739_598_000,
            duration_ms: 100,
        }
    }

    #[test]
    fn test_search_finds_content() {
        let idx = SearchIndex::open_in_ram().unwrap();
        let tenant = Uuid::new_v4();
        let job = Uuid::new_v4();

        idx.index_job(
            job,
            &[
                doc(tenant, job, 1, "api", "alice", "GLEWF on HPD Help Desk"),
                doc(tenant, job, 2, "sql", "alice", "SELECT schemaid FROM arschema"),
            ],
        )
        .unwrap();
        idx.commit().unwrap();
        idx.reader.reload().unwrap();

        let result = idx.search(tenant, "arschema", 10, 0).unwrap();
        assert_eq!(result.total_matches, 1);
        assert_eq!(result.hits[0].line_no, 2);
        assert_eq!(result.hits[0].log_type, "sql");
    }

    #[test]
    fn test_search_never_crosses_tenants() {
        let idx = SearchIndex::open_in_ram().unwrap();
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();

        idx.index_job(job_a, &[doc(tenant_a, job_a, 1, "api", "alice", "shared phrase")])
            .unwrap();
        idx.index_job(job_b, &[doc(tenant_b, job_b, 1, "api", "bob", "shared phrase")])
            .unwrap();
        idx.commit().unwrap();
        idx.reader.reload().unwrap();

        let result = idx.search(tenant_a, "shared phrase", 10, 0).unwrap();
        assert_eq!(result.total_matches, 1);
        assert_eq!(result.hits[0].user, "alice");
    }

    #[test]
    fn test_qualifier_filters() {
        let idx = SearchIndex::open_in_ram().unwrap();
        let tenant = Uuid::new_v4();
        let job = Uuid::new_v4();

        idx.index_job(
            job,
            &[
                doc(tenant, job, 1, "api", "alice", "slow call"),
                doc(tenant, job, 2, "sql", "bob", "slow call"),
            ],
        )
        .unwrap();
        idx.commit().unwrap();
        idx.reader.reload().unwrap();

        let result = idx.search(tenant, "type:sql slow", 10, 0).unwrap();
        assert_eq!(result.total_matches, 1);
        assert_eq!(result.hits[0].user, "bob");

        let result = idx.search(tenant, "user:alice", 10, 0).unwrap();
        assert_eq!(result.total_matches, 1);
        assert_eq!(result.hits[0].log_type, "api");
    }

    #[test]
    fn test_job_qualifier_scopes_to_one_job() {
        let idx = SearchIndex::open_in_ram().unwrap();
        let tenant = Uuid::new_v4();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();

        idx.index_job(job_a, &[doc(tenant, job_a, 1, "api", "alice", "needle")])
            .unwrap();
        idx.index_job(job_b, &[doc(tenant, job_b, 1, "api", "alice", "needle")])
            .unwrap();
        idx.commit().unwrap();
        idx.reader.reload().unwrap();

        let result = idx
            .search(tenant, &format!("job:{job_a} needle"), 10, 0)
            .unwrap();
        assert_eq!(result.total_matches, 1);
        assert_eq!(result.hits[0].job_id, job_a.to_string());
    }

    #[test]
    fn test_empty_query_returns_empty() {
        let idx = SearchIndex::open_in_ram().unwrap();
        let result = idx.search(Uuid::new_v4(), "", 10, 0).unwrap();
        assert_eq!(result.total_matches, 0);
        assert!(result.hits.is_empty());
    }

    #[test]
    fn test_reindex_job_replaces_old_docs() {
        let idx = SearchIndex::open_in_ram().unwrap();
        let tenant = Uuid::new_v4();
        let job = Uuid::new_v4();

        idx.index_job(job, &[doc(tenant, job, 1, "api", "alice", "original words")])
            .unwrap();
        idx.commit().unwrap();
        idx.reader.reload().unwrap();
        assert_eq!(idx.search(tenant, "original", 10, 0).unwrap().total_matches, 1);

        idx.index_job(job, &[doc(tenant, job, 1, "api", "alice", "replacement words")])
            .unwrap();
        idx.commit().unwrap();
        idx.reader.reload().unwrap();

        assert_eq!(idx.search(tenant, "original", 10, 0).unwrap().total_matches, 0);
        assert_eq!(
            idx.search(tenant, "replacement", 10, 0).unwrap().total_matches,
            1
        );
    }

    #[test]
    fn test_pagination() {
        let idx = SearchIndex::open_in_ram().unwrap();
        let tenant = Uuid::new_v4();
        let job = Uuid::new_v4();

        let docs: Vec<crate::LogDocument> = (0..5)
            .map(|i| doc(tenant, job, i, "api", "alice", "repeated phrase"))
            .collect();
        idx.index_job(job, &docs).unwrap();
        idx.commit().unwrap();
        idx.reader.reload().unwrap();

        let page1 = idx.search(tenant, "repeated", 2, 0).unwrap();
        assert_eq!(page1.total_matches, 5);
        assert_eq!(page1.hits.len(), 2);

        let page3 = idx.search(tenant, "repeated", 2, 4).unwrap();
        assert_eq!(page3.hits.len(), 1);
    }
}
