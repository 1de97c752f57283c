//! Distributional summaries over a completed result set.
//!
//! Percentiles use the nearest-rank rule on the sorted latency set:
//! the value at index `floor(q * N)`, clamped to the last element. No
//! interpolation, so summaries are exactly reproducible.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::OutcomeKind;
use crate::result::RequestResult;

/// Latency statistics in seconds over measured requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Number of measured samples
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencySummary {
    /// Builds a summary from latencies already sorted ascending.
    /// Returns `None` for an empty set.
    pub fn from_sorted(sorted: &[f64]) -> Option<Self> {
        let first = *sorted.first()?;
        let last = *sorted.last()?;
        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;

        Some(Self {
            count: sorted.len(),
            min: first,
            max: last,
            mean,
            p50: nearest_rank(sorted, 0.50)?,
            p95: nearest_rank(sorted, 0.95)?,
            p99: nearest_rank(sorted, 0.99)?,
        })
    }

    /// Format statistics as a human-readable string.
    pub fn format(&self) -> String {
        format!(
            "count={}, min={:.2}ms, max={:.2}ms, mean={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms",
            self.count,
            self.min * 1000.0,
            self.max * 1000.0,
            self.mean * 1000.0,
            self.p50 * 1000.0,
            self.p95 * 1000.0,
            self.p99 * 1000.0,
        )
    }
}

/// Value at index `floor(q * N)` of `sorted`, clamped to `N - 1`.
pub fn nearest_rank(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = ((q * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
    Some(sorted[idx])
}

/// Aggregate view of a run's results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub success_count: usize,
    /// Every observed status code, including 0, ascending.
    pub by_status: BTreeMap<u16, usize>,
    /// Count per outcome kind; all four kinds are present.
    pub by_outcome: BTreeMap<OutcomeKind, usize>,
    /// Absent when no request was measured.
    pub latency: Option<LatencySummary>,
}

impl RunSummary {
    /// Fraction of requests that succeeded; 0.0 for an empty run.
    pub fn success_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total as f64
        }
    }

    pub fn failed_count(&self) -> usize {
        self.total - self.success_count
    }

    pub fn outcome_count(&self, kind: OutcomeKind) -> usize {
        self.by_outcome.get(&kind).copied().unwrap_or(0)
    }
}

/// Summarizes a result set. Pure: the same input always yields the same
/// summary.
pub fn summarize(results: &[RequestResult]) -> RunSummary {
    let mut by_status = BTreeMap::new();
    let mut by_outcome: BTreeMap<OutcomeKind, usize> =
        OutcomeKind::all().into_iter().map(|k| (k, 0)).collect();
    let mut success_count = 0;
    let mut latencies = Vec::with_capacity(results.len());

    for r in results {
        *by_status.entry(r.status_code()).or_insert(0) += 1;
        *by_outcome.entry(r.outcome()).or_insert(0) += 1;
        if r.is_success() {
            success_count += 1;
        }
        if r.total_time() > 0.0 {
            latencies.push(r.total_time());
        }
    }

    latencies.sort_by(|a, b| a.total_cmp(b));

    RunSummary {
        total: results.len(),
        success_count,
        by_status,
        by_outcome,
        latency: LatencySummary::from_sorted(&latencies),
    }
}
