// crates/core/src/decoder.rs
//! Decoder for the analyzer's section-delimited text report.
//!
//! A report is a sequence of sections, each opened by a `=== <name> ===`
//! header line. Section bodies are decoded by kind: scalar statistics,
//! `key: count` distributions, pipe-delimited Top-N tables, or hourly
//! time-series buckets. Unknown section names are skipped so that newer
//! analyzer builds can add sections without breaking older decoders.
//! Missing data is never an error; only an empty report is.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::debug;

use crate::error::ParseError;
use crate::types::{
    DashboardData, Distribution, ParseResult, TimeBucket, TopEntry,
};

/// Decode a full analyzer report into a [`ParseResult`].
///
/// Fails with [`ParseError::EmptyInput`] when the report is empty or
/// whitespace-only. Any report containing at least one recognised section
/// header decodes successfully, possibly with empty sections.
pub fn parse_output(report: &str) -> Result<ParseResult, ParseError> {
    if report.trim().is_empty() {
        return Err(ParseError::EmptyInput);
    }

    let mut dashboard = DashboardData::default();

    for section in split_sections(report) {
        let Some(kind) = SectionKind::from_name(section.name) else {
            debug!(section = section.name, "skipping unrecognised section");
            continue;
        };
        match kind {
            SectionKind::GeneralStats => decode_stats(&section.body, &mut dashboard),
            SectionKind::TopApi => dashboard.top_api = decode_pipe_table(&section.body),
            SectionKind::TopSql => dashboard.top_sql = decode_pipe_table(&section.body),
            SectionKind::TopFilters => dashboard.top_filters = decode_pipe_table(&section.body),
            SectionKind::TopEscalations => {
                dashboard.top_escalations = decode_pipe_table(&section.body)
            }
            SectionKind::QueuedApi => dashboard.queued_api = decode_pipe_table(&section.body),
            SectionKind::ThreadDist => {
                decode_distribution(&section.body, &mut dashboard.distributions.threads)
            }
            SectionKind::UserDist => {
                decode_distribution(&section.body, &mut dashboard.distributions.users)
            }
            SectionKind::FormDist => {
                decode_distribution(&section.body, &mut dashboard.distributions.forms)
            }
            SectionKind::ErrorDist => {
                decode_distribution(&section.body, &mut dashboard.distributions.errors)
            }
            SectionKind::HourlyActivity => {
                dashboard.time_series = decode_time_series(&section.body)
            }
        }
    }

    Ok(ParseResult { dashboard })
}

/// Section kinds the decoder understands, dispatched by canonical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    GeneralStats,
    TopApi,
    TopSql,
    TopFilters,
    TopEscalations,
    QueuedApi,
    ThreadDist,
    UserDist,
    FormDist,
    ErrorDist,
    HourlyActivity,
}

impl SectionKind {
    /// Case-sensitive lookup including aliases.
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "General Statistics" => Some(SectionKind::GeneralStats),
            "Top N API Calls" | "Top API Calls" => Some(SectionKind::TopApi),
            "Top N SQL Statements" | "Top SQL Statements" => Some(SectionKind::TopSql),
            "Top N Filters" | "Top Filter Executions" => Some(SectionKind::TopFilters),
            "Top N Escalations" | "Top Escalation Executions" => {
                Some(SectionKind::TopEscalations)
            }
            "Queued API Calls" => Some(SectionKind::QueuedApi),
            "Thread Distribution" => Some(SectionKind::ThreadDist),
            "User Distribution" | "User Statistics" => Some(SectionKind::UserDist),
            "Form Distribution" | "Form Statistics" => Some(SectionKind::FormDist),
            "Exception Distribution" | "Exceptions" | "Error Distribution" => {
                Some(SectionKind::ErrorDist)
            }
            "Hourly Activity" => Some(SectionKind::HourlyActivity),
            _ => None,
        }
    }
}

/// A raw section: its header name and body lines (blanks included).
struct RawSection<'a> {
    name: &'a str,
    body: Vec<&'a str>,
}

/// Split the report into sections. Text before the first header is ignored.
fn split_sections(report: &str) -> Vec<RawSection<'_>> {
    let mut sections: Vec<RawSection<'_>> = Vec::new();
    for line in report.lines() {
        if let Some(name) = header_name(line) {
            sections.push(RawSection {
                name,
                body: Vec::new(),
            });
        } else if let Some(current) = sections.last_mut() {
            current.body.push(line);
        }
    }
    sections
}

/// Return the section name if the line is exactly `=== <name> ===`.
fn header_name(line: &str) -> Option<&str> {
    let trimmed = line.trim_end_matches('\r');
    let inner = trimmed.strip_prefix("=== ")?.strip_suffix(" ===")?;
    if inner.is_empty() {
        return None;
    }
    Some(inner)
}

/// Parse an integer that may carry comma thousands-separators.
fn parse_count(text: &str) -> Option<u64> {
    let cleaned: String = text.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn decode_stats(body: &[&str], dashboard: &mut DashboardData) {
    let stats = &mut dashboard.stats;
    for line in body {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "Total Lines Processed" => stats.total_lines = parse_count(value).unwrap_or(0),
            "API Calls" => stats.api_calls = parse_count(value).unwrap_or(0),
            "SQL Operations" => stats.sql_operations = parse_count(value).unwrap_or(0),
            "Filter Executions" => stats.filter_executions = parse_count(value).unwrap_or(0),
            "Escalation Operations" => {
                stats.escalation_operations = parse_count(value).unwrap_or(0)
            }
            "Unique Users" => stats.unique_users = parse_count(value).unwrap_or(0),
            "Unique Forms" => stats.unique_forms = parse_count(value).unwrap_or(0),
            "Unique Tables" => stats.unique_tables = parse_count(value).unwrap_or(0),
            "Unique Queues" => stats.unique_queues = parse_count(value).unwrap_or(0),
            "Log Duration" => stats.log_duration = value.to_string(),
            _ => debug!(key, "skipping unknown statistics key"),
        }
    }
}

/// Split a `key: count` line on the **last** colon whose right-hand side is
/// integer-shaped. Keys may themselves contain colons (`HPD:Help Desk: 42`
/// yields key `HPD:Help Desk`). Returns `None` for lines that do not match.
fn split_counted_line(line: &str) -> Option<(&str, u64)> {
    for (idx, ch) in line.char_indices().rev() {
        if ch != ':' {
            continue;
        }
        if let Some(count) = parse_count(&line[idx + 1..]) {
            return Some((line[..idx].trim(), count));
        }
    }
    None
}

fn decode_distribution(body: &[&str], dist: &mut Distribution) {
    for line in body {
        let Some((key, count)) = split_counted_line(line) else {
            continue;
        };
        // Zero counts are dropped at decode time.
        if count == 0 {
            continue;
        }
        dist.add(key.to_string(), count);
    }
}

fn decode_time_series(body: &[&str]) -> Vec<TimeBucket> {
    let mut buckets = Vec::new();
    for line in body {
        let Some((bucket, count)) = split_counted_line(line) else {
            continue;
        };
        if bucket.is_empty() {
            continue;
        }
        buckets.push(TimeBucket {
            timestamp: bucket.to_string(),
            count,
        });
    }
    buckets
}

// ---------------------------------------------------------------------------
// Pipe tables
// ---------------------------------------------------------------------------

/// Entry fields a pipe-table column can populate. Unknown columns are kept
/// in position (so later cells still line up) but ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Rank,
    LineNo,
    File,
    Timestamp,
    Thread,
    Rpc,
    Queue,
    Identifier,
    Form,
    User,
    DurationMs,
    Status,
    Details,
    Unknown,
}

impl Column {
    fn from_header(name: &str) -> Self {
        match name {
            "Rank" => Column::Rank,
            "Line#" => Column::LineNo,
            "File" => Column::File,
            "Timestamp" => Column::Timestamp,
            "Thread" => Column::Thread,
            "RPC" => Column::Rpc,
            "Queue" => Column::Queue,
            "Identifier" => Column::Identifier,
            "Form" => Column::Form,
            "User" => Column::User,
            "Duration(ms)" => Column::DurationMs,
            "Status" => Column::Status,
            "Details" => Column::Details,
            _ => Column::Unknown,
        }
    }
}

/// Split a `| a | b | c |` row into trimmed cells, dropping the empty
/// fragments produced by the leading and trailing pipes.
fn split_row(line: &str) -> Vec<&str> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(str::trim).collect()
}

/// A row whose cells contain only dashes is the header/body separator.
fn is_separator_row(cells: &[&str]) -> bool {
    !cells.is_empty()
        && cells
            .iter()
            .all(|c| !c.is_empty() && c.chars().all(|ch| ch == '-'))
}

/// Recognised success synonyms: `OK` and `Success`, case-insensitive.
fn is_success_status(status: &str) -> bool {
    status.eq_ignore_ascii_case("ok") || status.eq_ignore_ascii_case("success")
}

/// Timestamps appear in a handful of formats depending on the analyzer's
/// locale settings; all are treated as UTC.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    const FORMATS: [&str; 3] = [
        "%Y-%m-%d %H:%M:%S%.3f",
        "%Y-%m-%d %H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
    ];
    let trimmed = text.trim();
    for format in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Decode a Top-N pipe table body into entries.
///
/// The first pipe row is the column header, the separator row is skipped,
/// every remaining pipe row becomes one entry. Missing columns leave entry
/// fields at their zero values; entries with an empty identifier are still
/// emitted. Ranks are reassigned to the 1-based output position regardless
/// of what the rank column said.
fn decode_pipe_table(body: &[&str]) -> Vec<TopEntry> {
    let mut lines = body.iter().filter(|l| l.contains('|'));
    let Some(header_line) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<Column> = split_row(header_line)
        .into_iter()
        .map(Column::from_header)
        .collect();

    let mut entries = Vec::new();
    for line in lines {
        let cells = split_row(line);
        if is_separator_row(&cells) {
            continue;
        }
        let mut entry = TopEntry::default();
        for (column, cell) in columns.iter().zip(cells) {
            match column {
                // The parsed rank is not trusted; reassigned below.
                Column::Rank => {}
                Column::LineNo => entry.line_no = parse_count(cell).unwrap_or(0),
                Column::File => entry.file = parse_count(cell).unwrap_or(0) as u32,
                Column::Timestamp => entry.timestamp = parse_timestamp(cell),
                Column::Thread => entry.thread = cell.to_string(),
                Column::Rpc => entry.rpc = cell.to_string(),
                Column::Queue => entry.queue = cell.to_string(),
                Column::Identifier => entry.identifier = cell.to_string(),
                Column::Form => entry.form = cell.to_string(),
                Column::User => entry.user = cell.to_string(),
                Column::DurationMs => entry.duration_ms = parse_count(cell).unwrap_or(0),
                Column::Status => entry.success = is_success_status(cell),
                Column::Details => entry.details = cell.to_string(),
                Column::Unknown => {}
            }
        }
        entries.push(entry);
    }

    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = (i + 1) as u32;
    }
    entries
}
