// crates/core/src/anomaly.rs
//! Statistical outlier detection over Top-N duration lists.

use crate::types::{Anomaly, AnomalyKind, TopEntry};

/// Default z-score threshold, overridable process-wide.
pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 3.0;

/// Detect duration outliers in one Top-N list.
///
/// Uses the sample mean and Bessel-corrected sample standard deviation
/// (divide by `N - 1`); an entry whose z-score exceeds `threshold` becomes
/// one anomaly. Lists of length ≤ 1, or with zero sample variance, produce
/// nothing.
pub fn detect_anomalies(entries: &[TopEntry], kind: AnomalyKind, threshold: f64) -> Vec<Anomaly> {
    if entries.len() < 2 {
        return Vec::new();
    }

    let n = entries.len() as f64;
    let mean = entries.iter().map(|e| e.duration_ms as f64).sum::<f64>() / n;
    let variance = entries
        .iter()
        .map(|e| {
            let d = e.duration_ms as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1.0);
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return Vec::new();
    }

    entries
        .iter()
        .filter_map(|entry| {
            let sigma = (entry.duration_ms as f64 - mean) / std_dev;
            if sigma <= threshold {
                return None;
            }
            let label = match kind {
                AnomalyKind::SlowApi => "API call",
                AnomalyKind::SlowSql => "SQL statement",
            };
            Some(Anomaly {
                kind,
                title: format!("Unusually slow {label}"),
                description: format!(
                    "{} took {} ms, {:.1} standard deviations above the mean of {:.1} ms",
                    entry.identifier, entry.duration_ms, sigma, mean
                ),
                identifier: entry.identifier.clone(),
                value_ms: entry.duration_ms,
                sigma,
            })
        })
        .collect()
}
