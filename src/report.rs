//! Final run report: the aggregate summary, the FD trend for round-based
//! runs, and the acceptance verdict derived from them.

use std::fmt::{self, Write as _};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::config_validation::ValidationError;
use crate::errors::{categorize_status_code, OutcomeKind};
use crate::fd_sampler::FdSample;
use crate::stats::RunSummary;

/// How the report is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
}

impl FromStr for ReportFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "human" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            other => Err(ValidationError::InvalidEnum {
                field: "report_format".to_string(),
                value: other.to_string(),
                expected: "text, json".to_string(),
            }),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Text => write!(f, "text"),
            ReportFormat::Json => write!(f, "json"),
        }
    }
}

/// Movement of the monitored process's open FD count across rounds.
///
/// Sentinel samples are ignored; `first`/`last`/`peak` are over valid
/// samples only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FdTrend {
    pub first: i64,
    pub last: i64,
    pub peak: i64,
    pub delta: i64,
    /// Number of rounds whose sample was unavailable
    pub unavailable: usize,
    pub leak_suspected: bool,
}

impl FdTrend {
    /// `None` when no sample was available at all.
    pub fn from_samples(samples: &[FdSample], tolerance: i64) -> Option<Self> {
        let valid: Vec<i64> = samples
            .iter()
            .filter(|s| s.is_available())
            .map(|s| s.open_fds)
            .collect();

        let first = *valid.first()?;
        let last = *valid.last()?;
        let peak = valid.iter().copied().max().unwrap_or(last);
        let delta = last - first;

        Some(Self {
            first,
            last,
            peak,
            delta,
            unavailable: samples.len() - valid.len(),
            leak_suspected: delta > tolerance,
        })
    }
}

/// Acceptance verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every request succeeded
    Passed,
    /// Success ratio reached the threshold
    MostlyPassed,
    Failed,
}

impl Verdict {
    pub fn evaluate(summary: &RunSummary, threshold: f64) -> Self {
        if summary.total == 0 {
            Verdict::Failed
        } else if summary.success_count == summary.total {
            Verdict::Passed
        } else if summary.success_ratio() >= threshold {
            Verdict::MostlyPassed
        } else {
            Verdict::Failed
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Passed | Verdict::MostlyPassed => 0,
            Verdict::Failed => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Passed => "PASSED",
            Verdict::MostlyPassed => "MOSTLY PASSED",
            Verdict::Failed => "FAILED",
        }
    }
}

/// Read-only report produced once at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(flatten)]
    pub summary: RunSummary,
    pub elapsed_secs: f64,
    pub throughput_rps: f64,
    pub success_threshold: f64,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fd_samples: Vec<FdSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fd_trend: Option<FdTrend>,
}

impl RunReport {
    pub fn new(
        summary: RunSummary,
        elapsed: Duration,
        fd_samples: Vec<FdSample>,
        success_threshold: f64,
        fd_leak_tolerance: i64,
    ) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let throughput_rps = if elapsed_secs > 0.0 {
            summary.total as f64 / elapsed_secs
        } else {
            0.0
        };
        let verdict = Verdict::evaluate(&summary, success_threshold);
        let fd_trend = FdTrend::from_samples(&fd_samples, fd_leak_tolerance);

        Self {
            summary,
            elapsed_secs,
            throughput_rps,
            success_threshold,
            verdict,
            fd_samples,
            fd_trend,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable report.
    pub fn render_text(&self) -> String {
        let s = &self.summary;
        let mut out = String::new();

        let _ = writeln!(out, "\n{}", "=".repeat(60));
        let _ = writeln!(out, "SOCKS5 PROXY LOAD TEST RESULTS");
        let _ = writeln!(out, "{}", "=".repeat(60));
        let _ = writeln!(out, "Total requests:   {}", s.total);
        let _ = writeln!(
            out,
            "Successful:       {} ({:.1}%)",
            s.success_count,
            s.success_ratio() * 100.0
        );
        for kind in OutcomeKind::all().into_iter().filter(|k| !k.is_success()) {
            let _ = writeln!(
                out,
                "{:<17} {}",
                format!("{}:", kind.description()),
                s.outcome_count(kind)
            );
        }
        let _ = writeln!(out, "Elapsed:          {:.2}s", self.elapsed_secs);
        let _ = writeln!(out, "Throughput:       {:.1} req/s", self.throughput_rps);

        let _ = writeln!(out, "\nStatus codes:");
        for (code, count) in &s.by_status {
            let _ = writeln!(
                out,
                "  {:>3}  {:<14} {}",
                code,
                categorize_status_code(*code),
                count
            );
        }

        let _ = writeln!(out, "\nResponse times:");
        match &s.latency {
            Some(lat) => {
                let _ = writeln!(out, "  Min:  {:.3}s", lat.min);
                let _ = writeln!(out, "  Max:  {:.3}s", lat.max);
                let _ = writeln!(out, "  Mean: {:.3}s", lat.mean);
                let _ = writeln!(out, "  P50:  {:.3}s", lat.p50);
                let _ = writeln!(out, "  P95:  {:.3}s", lat.p95);
                let _ = writeln!(out, "  P99:  {:.3}s", lat.p99);
            }
            None => {
                let _ = writeln!(out, "  (no measured responses)");
            }
        }

        if !self.fd_samples.is_empty() {
            let _ = writeln!(out, "\nOpen file descriptors per round:");
            for sample in &self.fd_samples {
                if sample.is_available() {
                    let _ = writeln!(out, "  Round {:>3}: {}", sample.round, sample.open_fds);
                } else {
                    let _ = writeln!(out, "  Round {:>3}: unavailable", sample.round);
                }
            }
            match &self.fd_trend {
                Some(trend) => {
                    let _ = writeln!(
                        out,
                        "  first={} last={} peak={} delta={:+}{}",
                        trend.first,
                        trend.last,
                        trend.peak,
                        trend.delta,
                        if trend.leak_suspected {
                            "  (possible FD leak)"
                        } else {
                            ""
                        }
                    );
                }
                None => {
                    let _ = writeln!(out, "  no valid samples");
                }
            }
        }

        let _ = writeln!(
            out,
            "\nVerdict: {} (threshold {:.0}%)",
            self.verdict.label(),
            self.success_threshold * 100.0
        );
        let _ = writeln!(out, "{}", "=".repeat(60));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd_sampler::FD_UNAVAILABLE;
    use crate::result::RequestResult;
    use crate::stats::summarize;

    fn samples(values: &[i64]) -> Vec<FdSample> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| FdSample {
                round: i + 1,
                open_fds: *v,
            })
            .collect()
    }

    fn summary(successes: usize, failures: usize) -> RunSummary {
        let mut results = vec![RequestResult::from_response(200, 0.01, 0.001); successes];
        results.extend(vec![RequestResult::transport_error(); failures]);
        summarize(&results)
    }

    #[test]
    fn fd_trend_ignores_sentinels() {
        let trend = FdTrend::from_samples(&samples(&[FD_UNAVAILABLE, 40, 55, 42, FD_UNAVAILABLE]), 10)
            .unwrap();
        assert_eq!(trend.first, 40);
        assert_eq!(trend.last, 42);
        assert_eq!(trend.peak, 55);
        assert_eq!(trend.delta, 2);
        assert_eq!(trend.unavailable, 2);
        assert!(!trend.leak_suspected);
    }

    #[test]
    fn fd_trend_flags_growth_beyond_tolerance() {
        let trend = FdTrend::from_samples(&samples(&[40, 60, 80, 100]), 10).unwrap();
        assert_eq!(trend.delta, 60);
        assert!(trend.leak_suspected);

        let at_limit = FdTrend::from_samples(&samples(&[40, 50]), 10).unwrap();
        assert!(!at_limit.leak_suspected);
    }

    #[test]
    fn fd_trend_absent_without_valid_samples() {
        assert!(FdTrend::from_samples(&[], 10).is_none());
        assert!(FdTrend::from_samples(&samples(&[FD_UNAVAILABLE; 3]), 10).is_none());
    }

    #[test]
    fn verdicts() {
        assert_eq!(Verdict::evaluate(&summary(10, 0), 0.9), Verdict::Passed);
        assert_eq!(Verdict::evaluate(&summary(9, 1), 0.9), Verdict::MostlyPassed);
        assert_eq!(Verdict::evaluate(&summary(8, 2), 0.9), Verdict::Failed);
        assert_eq!(Verdict::evaluate(&summary(0, 0), 0.0), Verdict::Failed);

        assert_eq!(Verdict::Passed.exit_code(), 0);
        assert_eq!(Verdict::MostlyPassed.exit_code(), 0);
        assert_eq!(Verdict::Failed.exit_code(), 1);
    }

    #[test]
    fn throughput_from_elapsed() {
        let report = RunReport::new(summary(50, 0), Duration::from_secs(2), vec![], 0.9, 10);
        assert_eq!(report.throughput_rps, 25.0);
        assert_eq!(report.exit_code(), 0);

        let instant = RunReport::new(summary(1, 0), Duration::ZERO, vec![], 0.9, 10);
        assert_eq!(instant.throughput_rps, 0.0);
    }

    #[test]
    fn text_report_lists_status_codes_and_fds() {
        let report = RunReport::new(
            summary(3, 1),
            Duration::from_millis(500),
            samples(&[12, FD_UNAVAILABLE]),
            0.5,
            10,
        );
        let text = report.render_text();
        assert!(text.contains("Total requests:   4"));
        assert!(text.contains("Successful:       3 (75.0%)"));
        assert!(text.contains("200"));
        assert!(text.contains("No Response"));
        assert!(text.contains("Round   2: unavailable"));
        assert!(text.contains("Verdict: MOSTLY PASSED"));
    }

    #[test]
    fn text_report_without_latency() {
        let report = RunReport::new(summary(0, 5), Duration::from_secs(1), vec![], 0.9, 10);
        let text = report.render_text();
        assert!(text.contains("(no measured responses)"));
        assert!(text.contains("Verdict: FAILED"));
        assert!(!text.contains("Open file descriptors"));
    }

    #[test]
    fn json_report_shape() {
        let report = RunReport::new(
            summary(2, 0),
            Duration::from_secs(1),
            samples(&[10, 11]),
            0.9,
            10,
        );
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["total"], 2);
        assert_eq!(value["success_count"], 2);
        assert_eq!(value["by_status"]["200"], 2);
        assert_eq!(value["by_outcome"]["success"], 2);
        assert_eq!(value["verdict"], "passed");
        assert_eq!(value["fd_trend"]["delta"], 1);
        assert_eq!(value["fd_samples"][1]["open_fds"], 11);
    }

    #[test]
    fn report_format_parsing() {
        assert_eq!("JSON".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert_eq!("text".parse::<ReportFormat>().unwrap(), ReportFormat::Text);
        let err = "xml".parse::<ReportFormat>().unwrap_err();
        assert!(err.to_string().contains("text, json"), "{}", err);
    }
}
