//! Open file-descriptor sampling for the monitored process.
//!
//! A sample is a plain count, or [`FD_UNAVAILABLE`] when the inspection
//! facility is missing, the process does not exist, or the sample did not
//! finish in time. Sampling never fails the run.

use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use crate::config_validation::ValidationError;

/// Sentinel for "could not sample".
pub const FD_UNAVAILABLE: i64 = -1;

/// One FD observation taken after a round settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FdSample {
    /// 1-based round number
    pub round: usize,
    pub open_fds: i64,
}

impl FdSample {
    pub fn is_available(&self) -> bool {
        self.open_fds >= 0
    }
}

#[async_trait]
pub trait FdSampler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Count of open handles held by `pid`, or [`FD_UNAVAILABLE`].
    async fn sample(&self, pid: u32) -> i64;
}

/// Which inspection facility to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    /// `lsof -p <pid>`
    Lsof,
    /// `/proc/<pid>/fd` (Linux only)
    Procfs,
}

impl FromStr for SamplerKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lsof" => Ok(SamplerKind::Lsof),
            "procfs" | "proc" => Ok(SamplerKind::Procfs),
            other => Err(ValidationError::InvalidEnum {
                field: "fd_sampler".to_string(),
                value: other.to_string(),
                expected: "lsof, procfs".to_string(),
            }),
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerKind::Lsof => write!(f, "lsof"),
            SamplerKind::Procfs => write!(f, "procfs"),
        }
    }
}

/// Builds the configured sampler.
pub fn build_sampler(kind: SamplerKind, timeout: Duration) -> Arc<dyn FdSampler> {
    match kind {
        SamplerKind::Lsof => Arc::new(LsofSampler::new("lsof", timeout)),
        SamplerKind::Procfs => Arc::new(ProcfsSampler::new(timeout)),
    }
}

/// Counts handles from `lsof -p <pid>` output: lines minus the header line.
pub fn count_lsof_lines(output: &str) -> i64 {
    let lines = output.lines().count() as i64;
    if lines == 0 {
        FD_UNAVAILABLE
    } else {
        lines - 1
    }
}

/// Samples through the external `lsof` tool.
#[derive(Debug, Clone)]
pub struct LsofSampler {
    program: String,
    timeout: Duration,
}

impl LsofSampler {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl FdSampler for LsofSampler {
    fn name(&self) -> &'static str {
        "lsof"
    }

    async fn sample(&self, pid: u32) -> i64 {
        let run = Command::new(&self.program)
            .arg("-p")
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        match time::timeout(self.timeout, run).await {
            Err(_) => {
                warn!(pid, timeout_ms = self.timeout.as_millis() as u64, "lsof timed out");
                FD_UNAVAILABLE
            }
            Ok(Err(e)) => {
                warn!(pid, program = %self.program, error = %e, "Failed to run lsof");
                FD_UNAVAILABLE
            }
            Ok(Ok(output)) if !output.status.success() => {
                debug!(pid, status = ?output.status.code(), "lsof exited unsuccessfully");
                FD_UNAVAILABLE
            }
            Ok(Ok(output)) => count_lsof_lines(&String::from_utf8_lossy(&output.stdout)),
        }
    }
}

/// Samples by counting entries of `/proc/<pid>/fd`.
#[derive(Debug, Clone)]
pub struct ProcfsSampler {
    timeout: Duration,
}

impl ProcfsSampler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl FdSampler for ProcfsSampler {
    fn name(&self) -> &'static str {
        "procfs"
    }

    async fn sample(&self, pid: u32) -> i64 {
        match time::timeout(
            self.timeout,
            tokio::task::spawn_blocking(move || procfs_fd_count(pid)),
        )
        .await
        {
            Ok(Ok(Some(count))) => count,
            Ok(Ok(None)) => FD_UNAVAILABLE,
            Ok(Err(e)) => {
                warn!(pid, error = %e, "FD sampling task failed");
                FD_UNAVAILABLE
            }
            Err(_) => {
                warn!(pid, timeout_ms = self.timeout.as_millis() as u64, "procfs FD sample timed out");
                FD_UNAVAILABLE
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn procfs_fd_count(pid: u32) -> Option<i64> {
    use procfs::process::Process;

    let pid = i32::try_from(pid).ok()?;
    match Process::new(pid).and_then(|p| p.fd_count()) {
        Ok(count) => Some(count as i64),
        Err(e) => {
            warn!(pid, error = %e, "Failed to read /proc fd table");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn procfs_fd_count(pid: u32) -> Option<i64> {
    warn!(pid, "procfs FD sampling is not supported on this platform");
    None
}

/// Soft limit on open files for this harness process, if known.
#[cfg(target_os = "linux")]
pub fn open_files_soft_limit() -> Option<u64> {
    use procfs::process::{LimitValue, Process};

    match Process::myself().and_then(|me| me.limits()) {
        Ok(limits) => match limits.max_open_files.soft_limit {
            LimitValue::Value(v) => Some(v),
            LimitValue::Unlimited => None,
        },
        Err(e) => {
            debug!(error = %e, "Failed to read process limits");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn open_files_soft_limit() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsof_count_excludes_header() {
        let output = "COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME\n\
                      proxy 42 me cwd DIR 1,4 128 2 /\n\
                      proxy 42 me 0u CHR 16,1 0t0 5 /dev/ttys001\n\
                      proxy 42 me 3u IPv4 0x1 0t0 TCP *:1080 (LISTEN)\n";
        assert_eq!(count_lsof_lines(output), 3);
    }

    #[test]
    fn lsof_count_of_empty_output_is_sentinel() {
        assert_eq!(count_lsof_lines(""), FD_UNAVAILABLE);
        assert_eq!(count_lsof_lines("COMMAND PID\n"), 0);
    }

    #[test]
    fn sampler_kind_parsing() {
        assert_eq!("lsof".parse::<SamplerKind>().unwrap(), SamplerKind::Lsof);
        assert_eq!("PROCFS".parse::<SamplerKind>().unwrap(), SamplerKind::Procfs);
        assert!(matches!(
            "ps".parse::<SamplerKind>(),
            Err(ValidationError::InvalidEnum { .. })
        ));
    }

    #[test]
    fn sample_availability() {
        assert!(FdSample { round: 1, open_fds: 12 }.is_available());
        assert!(!FdSample {
            round: 1,
            open_fds: FD_UNAVAILABLE
        }
        .is_available());
    }

    #[tokio::test]
    async fn missing_lsof_yields_sentinel() {
        let sampler = LsofSampler::new("/nonexistent/bin/lsof-for-tests", Duration::from_secs(1));
        assert_eq!(sampler.sample(std::process::id()).await, FD_UNAVAILABLE);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn procfs_counts_own_descriptors() {
        let sampler = ProcfsSampler::new(Duration::from_secs(1));
        let count = sampler.sample(std::process::id()).await;
        // stdin/stdout/stderr at minimum
        assert!(count >= 3, "unexpected fd count {}", count);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn procfs_missing_process_yields_sentinel() {
        let sampler = ProcfsSampler::new(Duration::from_secs(1));
        // Above the default pid_max, so no such process.
        assert_eq!(sampler.sample(i32::MAX as u32).await, FD_UNAVAILABLE);
    }
}
