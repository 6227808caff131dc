// crates/core/src/enhance.rs
//! Derived report sections: grouped aggregates, exception rollups, thread
//! utilisation, filter complexity, and queue health.
//!
//! `build_enhanced_sections` is a pure fold over decoded dashboard data.
//! All orderings are deterministic: sorts are stable and ties keep the
//! order keys first appeared in the source list.

use std::collections::{HashMap, HashSet};

use chrono::Utc;

use crate::types::{
    AggregateGroupBy, AggregateReport, AggregateRow, AggregateSource, DashboardData,
    EnhancedSections, ExceptionEntry, ExceptionReport, FilterComplexity, GapSummary,
    MostExecutedFilter, QueueHealth, ThreadStat, TopEntry, TransactionFilterStats,
};

/// Group key fallback when an entry has no value for the grouping field.
const UNKNOWN_KEY: &str = "Unknown";

/// Build all derived sections from decoded dashboard data.
pub fn build_enhanced_sections(dashboard: &DashboardData) -> EnhancedSections {
    EnhancedSections {
        aggregates: vec![
            aggregate(
                &dashboard.top_api,
                AggregateSource::Api,
                AggregateGroupBy::Form,
                |e| &e.form,
            ),
            aggregate(
                &dashboard.top_api,
                AggregateSource::Api,
                AggregateGroupBy::User,
                |e| &e.user,
            ),
            // The analyzer emits the table name in the form column for SQL
            // rows; the identifier carries the statement.
            aggregate(
                &dashboard.top_sql,
                AggregateSource::Sql,
                AggregateGroupBy::Table,
                |e| &e.form,
            ),
        ],
        exceptions: build_exceptions(dashboard),
        threads: build_thread_stats(dashboard),
        filters: build_filter_complexity(&dashboard.top_filters),
        gaps: GapSummary {
            gaps: Vec::new(),
            queue_health: build_queue_health(&dashboard.top_api),
        },
    }
}

struct AggregateAcc {
    key: String,
    count: u64,
    total_ms: u64,
    min_ms: u64,
    max_ms: u64,
    error_count: u64,
    traces: HashSet<String>,
}

impl AggregateAcc {
    fn new(key: String) -> Self {
        Self {
            key,
            count: 0,
            total_ms: 0,
            min_ms: u64::MAX,
            max_ms: 0,
            error_count: 0,
            traces: HashSet::new(),
        }
    }

    fn fold(&mut self, entry: &TopEntry) {
        self.count += 1;
        self.total_ms += entry.duration_ms;
        self.min_ms = self.min_ms.min(entry.duration_ms);
        self.max_ms = self.max_ms.max(entry.duration_ms);
        if !entry.success {
            self.error_count += 1;
        }
        if !entry.rpc.is_empty() {
            self.traces.insert(entry.rpc.clone());
        }
    }

    fn finish(self) -> AggregateRow {
        let count = self.count;
        AggregateRow {
            key: self.key,
            count,
            total_ms: self.total_ms,
            min_ms: if count == 0 { 0 } else { self.min_ms },
            max_ms: self.max_ms,
            avg_ms: if count == 0 {
                0.0
            } else {
                self.total_ms as f64 / count as f64
            },
            error_count: self.error_count,
            error_rate: if count == 0 {
                0.0
            } else {
                self.error_count as f64 / count as f64 * 100.0
            },
            unique_traces: self.traces.len() as u64,
        }
    }
}

/// Aggregate one Top-N list by the given key, sorted by count descending.
/// The grand total spans all input entries and is omitted when the list is
/// empty.
fn aggregate<'a>(
    entries: &'a [TopEntry],
    source: AggregateSource,
    group_by: AggregateGroupBy,
    key_fn: impl Fn(&'a TopEntry) -> &'a str,
) -> AggregateReport {
    let mut groups: Vec<AggregateAcc> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut grand = AggregateAcc::new("Grand Total".to_string());

    for entry in entries {
        let raw_key = key_fn(entry);
        let key = if raw_key.is_empty() { UNKNOWN_KEY } else { raw_key };
        let slot = *index.entry(key.to_string()).or_insert_with(|| {
            groups.push(AggregateAcc::new(key.to_string()));
            groups.len() - 1
        });
        groups[slot].fold(entry);
        grand.fold(entry);
    }

    let mut rows: Vec<AggregateRow> = groups.into_iter().map(AggregateAcc::finish).collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count));

    AggregateReport {
        source,
        group_by,
        groups: rows,
        grand_total: (grand.count > 0).then(|| grand.finish()),
    }
}

/// Roll up the `errors` distribution into exception entries.
///
/// First/last seen are wall-clock at build time; the real time range lives
/// in the columnar store and is resolved by a later query.
fn build_exceptions(dashboard: &DashboardData) -> ExceptionReport {
    let now = Utc::now();
    let mut entries: Vec<ExceptionEntry> = dashboard
        .distributions
        .errors
        .iter()
        .map(|(code, count)| ExceptionEntry {
            code: code.clone(),
            count: *count,
            first_seen: now,
            last_seen: now,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count));

    let top_codes = entries.iter().take(10).map(|e| e.code.clone()).collect();

    let mut error_rates = Vec::new();
    let api_count = dashboard.stats.api_calls;
    if api_count > 0 {
        let total_errors = dashboard.distributions.errors.total();
        error_rates.push((
            "api".to_string(),
            total_errors as f64 / api_count as f64 * 100.0,
        ));
    }

    ExceptionReport {
        entries,
        top_codes,
        error_rates,
    }
}

/// Thread utilisation: seeded from the `threads` distribution, then folded
/// with per-entry duration, max, and error counts from the API and SQL
/// Top-N lists. Entries match a thread by their thread identifier, falling
/// back to the trace identifier when the thread field is unset.
fn build_thread_stats(dashboard: &DashboardData) -> Vec<ThreadStat> {
    let mut stats: Vec<ThreadStat> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (thread_id, count) in dashboard.distributions.threads.iter() {
        index.insert(thread_id.clone(), stats.len());
        stats.push(ThreadStat {
            thread_id: thread_id.clone(),
            calls: *count,
            ..Default::default()
        });
    }

    for entry in dashboard.top_api.iter().chain(dashboard.top_sql.iter()) {
        let key = entry.thread_key();
        if key.is_empty() {
            continue;
        }
        let seeded = dashboard.distributions.threads.get(key).is_some();
        let slot = match index.get(key) {
            Some(slot) => *slot,
            None => {
                // Threads the distribution missed still get a row; their
                // call count is the number of folded entries.
                index.insert(key.to_string(), stats.len());
                stats.push(ThreadStat {
                    thread_id: key.to_string(),
                    ..Default::default()
                });
                stats.len() - 1
            }
        };
        let stat = &mut stats[slot];
        if !seeded {
            stat.calls += 1;
        }
        stat.total_ms += entry.duration_ms;
        stat.max_ms = stat.max_ms.max(entry.duration_ms);
        if !entry.success {
            stat.error_count += 1;
        }
    }

    for stat in &mut stats {
        if stat.calls > 0 {
            stat.avg_ms = stat.total_ms as f64 / stat.calls as f64;
        }
        // Busy percent stays a placeholder until the log duration is
        // available in machine-readable form.
        stat.busy_percent = 0.0;
    }

    stats.sort_by(|a, b| b.calls.cmp(&a.calls));
    stats
}

/// Filter complexity from the Filter Top-N list.
fn build_filter_complexity(filters: &[TopEntry]) -> FilterComplexity {
    let mut most_executed: Vec<MostExecutedFilter> = Vec::new();
    let mut name_index: HashMap<String, usize> = HashMap::new();
    let mut per_txn: Vec<TransactionFilterStats> = Vec::new();
    let mut txn_index: HashMap<String, usize> = HashMap::new();
    let mut total_filter_time_ms = 0u64;

    for entry in filters {
        total_filter_time_ms += entry.duration_ms;

        let slot = *name_index
            .entry(entry.identifier.clone())
            .or_insert_with(|| {
                most_executed.push(MostExecutedFilter {
                    name: entry.identifier.clone(),
                    ..Default::default()
                });
                most_executed.len() - 1
            });
        most_executed[slot].count += 1;
        most_executed[slot].total_ms += entry.duration_ms;

        let slot = *txn_index.entry(entry.rpc.clone()).or_insert_with(|| {
            per_txn.push(TransactionFilterStats {
                rpc_id: entry.rpc.clone(),
                ..Default::default()
            });
            per_txn.len() - 1
        });
        per_txn[slot].filter_count += 1;
        per_txn[slot].total_ms += entry.duration_ms;
    }

    most_executed.sort_by(|a, b| b.count.cmp(&a.count));

    for txn in &mut per_txn {
        txn.filters_per_second = if txn.total_ms > 0 {
            txn.filter_count as f64 / (txn.total_ms as f64 / 1000.0)
        } else {
            0.0
        };
    }
    per_txn.sort_by(|a, b| b.total_ms.cmp(&a.total_ms));
    per_txn.truncate(100);

    FilterComplexity {
        most_executed,
        per_transaction: per_txn,
        nesting_levels: Vec::new(),
        total_filter_time_ms,
    }
}

/// Per-queue health over the API Top-N list. `p95_ms` is the value at index
/// `⌊0.95 × N⌋` of the sorted durations, clamped to `N - 1`.
fn build_queue_health(api: &[TopEntry]) -> Vec<QueueHealth> {
    struct QueueAcc {
        queue: String,
        durations: Vec<u64>,
        total_ms: u64,
        error_count: u64,
    }

    let mut queues: Vec<QueueAcc> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for entry in api {
        let key = if entry.queue.is_empty() {
            UNKNOWN_KEY
        } else {
            &entry.queue
        };
        let slot = *index.entry(key.to_string()).or_insert_with(|| {
            queues.push(QueueAcc {
                queue: key.to_string(),
                durations: Vec::new(),
                total_ms: 0,
                error_count: 0,
            });
            queues.len() - 1
        });
        let acc = &mut queues[slot];
        acc.durations.push(entry.duration_ms);
        acc.total_ms += entry.duration_ms;
        if !entry.success {
            acc.error_count += 1;
        }
    }

    let mut health: Vec<QueueHealth> = queues
        .into_iter()
        .map(|mut acc| {
            acc.durations.sort_unstable();
            let n = acc.durations.len();
            let p95_idx = ((0.95 * n as f64) as usize).min(n - 1);
            QueueHealth {
                queue: acc.queue,
                calls: n as u64,
                total_ms: acc.total_ms,
                avg_ms: acc.total_ms as f64 / n as f64,
                p95_ms: acc.durations[p95_idx],
                error_count: acc.error_count,
            }
        })
        .collect();

    health.sort_by(|a, b| b.calls.cmp(&a.calls));
    health
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DashboardStats, Distribution, Distributions};

    fn api_entry(form: &str, user: &str, dur: u64, success: bool, rpc: &str) -> TopEntry {
        TopEntry {
            form: form.to_string(),
            user: user.to_string(),
            duration_ms: dur,
            success,
            rpc: rpc.to_string(),
            ..Default::default()
        }
    }

    fn approx(a: f64, b: f64) {
        assert!((a - b).abs() < 0.01, "{a} !~ {b}");
    }

    #[test]
    fn test_aggregate_grand_total_derivation() {
        // Three forms with counts 3, 2, 1; durations summing 600, 400, 100;
        // errors 1, 0, 0.
        let entries = vec![
            api_entry("A", "u1", 100, false, "r1"),
            api_entry("A", "u1", 200, true, "r2"),
            api_entry("A", "u1", 300, true, "r3"),
            api_entry("B", "u2", 150, true, "r4"),
            api_entry("B", "u2", 250, true, "r5"),
            api_entry("C", "u3", 100, true, "r6"),
        ];
        let report = aggregate(
            &entries,
            AggregateSource::Api,
            AggregateGroupBy::Form,
            |e| &e.form,
        );

        let counts: Vec<u64> = report.groups.iter().map(|g| g.count).collect();
        assert_eq!(counts, vec![3, 2, 1]);
        assert_eq!(report.groups[0].key, "A");
        assert_eq!(report.groups[0].total_ms, 600);
        assert_eq!(report.groups[0].min_ms, 100);
        assert_eq!(report.groups[0].max_ms, 300);
        approx(report.groups[0].error_rate, 33.33);

        let grand = report.grand_total.expect("grand total present");
        assert_eq!(grand.count, 6);
        assert_eq!(grand.total_ms, 1100);
        approx(grand.avg_ms, 183.33);
        approx(grand.error_rate, 16.67);
        assert_eq!(grand.min_ms, 100);
        assert_eq!(grand.max_ms, 300);
        assert_eq!(grand.unique_traces, 6);
    }

    #[test]
    fn test_aggregate_empty_list_has_no_grand_total() {
        let report = aggregate(&[], AggregateSource::Api, AggregateGroupBy::Form, |e| {
            &e.form
        });
        assert!(report.groups.is_empty());
        assert!(report.grand_total.is_none());
    }

    #[test]
    fn test_aggregate_missing_key_maps_to_unknown() {
        let entries = vec![api_entry("", "u", 50, true, "r1")];
        let report = aggregate(
            &entries,
            AggregateSource::Api,
            AggregateGroupBy::Form,
            |e| &e.form,
        );
        assert_eq!(report.groups[0].key, "Unknown");
    }

    #[test]
    fn test_aggregate_ties_keep_source_order() {
        let entries = vec![
            api_entry("Zeta", "u", 10, true, "r1"),
            api_entry("Alpha", "u", 20, true, "r2"),
        ];
        let report = aggregate(
            &entries,
            AggregateSource::Api,
            AggregateGroupBy::Form,
            |e| &e.form,
        );
        // Both groups have count 1; the stable sort keeps first-seen order.
        assert_eq!(report.groups[0].key, "Zeta");
        assert_eq!(report.groups[1].key, "Alpha");
    }

    #[test]
    fn test_exceptions_sorted_with_top_codes_and_api_rate() {
        let mut errors = Distribution::default();
        errors.add("ERROR (302)".into(), 3);
        errors.add("ERROR (552)".into(), 9);
        let dashboard = DashboardData {
            stats: DashboardStats {
                api_calls: 100,
                ..Default::default()
            },
            distributions: Distributions {
                errors,
                ..Default::default()
            },
            ..Default::default()
        };

        let report = build_exceptions(&dashboard);
        assert_eq!(report.entries[0].code, "ERROR (552)");
        assert_eq!(report.entries[0].count, 9);
        assert_eq!(report.top_codes, vec!["ERROR (552)", "ERROR (302)"]);
        assert_eq!(report.error_rates.len(), 1);
        assert_eq!(report.error_rates[0].0, "api");
        approx(report.error_rates[0].1, 12.0);
    }

    #[test]
    fn test_exceptions_no_api_rate_when_no_api_calls() {
        let mut errors = Distribution::default();
        errors.add("ERROR (302)".into(), 3);
        let dashboard = DashboardData {
            distributions: Distributions {
                errors,
                ..Default::default()
            },
            ..Default::default()
        };
        let report = build_exceptions(&dashboard);
        assert!(report.error_rates.is_empty());
    }

    #[test]
    fn test_exceptions_top_codes_capped_at_ten() {
        let mut errors = Distribution::default();
        for i in 0..15 {
            errors.add(format!("ERROR ({i})"), 15 - i);
        }
        let dashboard = DashboardData {
            distributions: Distributions {
                errors,
                ..Default::default()
            },
            ..Default::default()
        };
        let report = build_exceptions(&dashboard);
        assert_eq!(report.entries.len(), 15);
        assert_eq!(report.top_codes.len(), 10);
    }

    #[test]
    fn test_thread_stats_fold_by_trace_fallback() {
        let mut threads = Distribution::default();
        threads.add("t-1".into(), 40);
        threads.add("t-2".into(), 10);
        let mut api = vec![
            api_entry("F", "u", 100, true, "t-1"),
            api_entry("F", "u", 300, false, "t-1"),
            api_entry("F", "u", 50, true, "t-2"),
        ];
        // Entry with an explicit thread field takes precedence over rpc.
        api[2].thread = "t-2".into();
        api[2].rpc = "other".into();

        let dashboard = DashboardData {
            top_api: api,
            distributions: Distributions {
                threads,
                ..Default::default()
            },
            ..Default::default()
        };
        let stats = build_thread_stats(&dashboard);

        assert_eq!(stats[0].thread_id, "t-1");
        assert_eq!(stats[0].calls, 40); // call count comes from the distribution
        assert_eq!(stats[0].total_ms, 400);
        assert_eq!(stats[0].max_ms, 300);
        assert_eq!(stats[0].error_count, 1);
        approx(stats[0].avg_ms, 10.0);
        assert_eq!(stats[0].busy_percent, 0.0);

        assert_eq!(stats[1].thread_id, "t-2");
        assert_eq!(stats[1].total_ms, 50);
    }

    #[test]
    fn test_thread_stats_unseeded_thread_counts_entries() {
        let dashboard = DashboardData {
            top_api: vec![
                api_entry("F", "u", 10, true, "orphan"),
                api_entry("F", "u", 30, true, "orphan"),
            ],
            ..Default::default()
        };
        let stats = build_thread_stats(&dashboard);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].thread_id, "orphan");
        assert_eq!(stats[0].calls, 2);
        approx(stats[0].avg_ms, 20.0);
    }

    #[test]
    fn test_filter_complexity_rollup() {
        let mut filters = vec![
            api_entry("", "", 100, true, "txn-1"),
            api_entry("", "", 200, true, "txn-1"),
            api_entry("", "", 500, true, "txn-2"),
        ];
        filters[0].identifier = "Set Status".into();
        filters[1].identifier = "Set Status".into();
        filters[2].identifier = "Notify".into();

        let report = build_filter_complexity(&filters);
        assert_eq!(report.total_filter_time_ms, 800);
        assert_eq!(report.most_executed[0].name, "Set Status");
        assert_eq!(report.most_executed[0].count, 2);
        assert_eq!(report.most_executed[0].total_ms, 300);

        // Per-transaction sorted by total time descending.
        assert_eq!(report.per_transaction[0].rpc_id, "txn-2");
        assert_eq!(report.per_transaction[0].filter_count, 1);
        approx(report.per_transaction[0].filters_per_second, 2.0);
        assert_eq!(report.per_transaction[1].rpc_id, "txn-1");
        approx(report.per_transaction[1].filters_per_second, 2.0 / 0.3);
        assert!(report.nesting_levels.is_empty());
    }

    #[test]
    fn test_filter_per_transaction_truncated_to_100() {
        let mut filters = Vec::new();
        for i in 0..150 {
            let mut e = api_entry("", "", i + 1, true, &format!("txn-{i}"));
            e.identifier = "F".into();
            filters.push(e);
        }
        let report = build_filter_complexity(&filters);
        assert_eq!(report.per_transaction.len(), 100);
        // Largest total time first.
        assert_eq!(report.per_transaction[0].rpc_id, "txn-149");
    }

    #[test]
    fn test_queue_health_p95_and_sorting() {
        let mut api = Vec::new();
        for i in 1..=20 {
            let mut e = api_entry("", "", i, i != 3, "r");
            e.queue = "Fast".into();
            api.push(e);
        }
        let mut slow = api_entry("", "", 1000, true, "r");
        slow.queue = "List".into();
        api.push(slow);

        let health = build_queue_health(&api);
        assert_eq!(health[0].queue, "Fast");
        assert_eq!(health[0].calls, 20);
        assert_eq!(health[0].error_count, 1);
        // ⌊0.95 × 20⌋ = 19 → last element of the sorted durations.
        assert_eq!(health[0].p95_ms, 20);
        assert_eq!(health[1].queue, "List");
        assert_eq!(health[1].p95_ms, 1000);
    }

    #[test]
    fn test_queue_health_empty_queue_is_unknown() {
        let api = vec![api_entry("", "", 10, true, "r")];
        let health = build_queue_health(&api);
        assert_eq!(health[0].queue, "Unknown");
    }

    #[test]
    fn test_build_enhanced_sections_shapes() {
        let dashboard = DashboardData::default();
        let sections = build_enhanced_sections(&dashboard);
        assert_eq!(sections.aggregates.len(), 3);
        assert!(sections.aggregates.iter().all(|a| a.grand_total.is_none()));
        assert!(sections.threads.is_empty());
        assert!(sections.gaps.gaps.is_empty());
        assert!(sections.gaps.queue_health.is_empty());
    }
}
