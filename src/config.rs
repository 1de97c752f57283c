use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;
use tokio::time::Duration;

use crate::client::{ClientBackend, ClientConfig, RequestSpec};
use crate::config_validation::{
    DurationValidator, ProxyAddrValidator, RangeValidator, UrlValidator, ValidationContext,
    ValidationError,
};
use crate::fd_sampler::SamplerKind;
use crate::report::ReportFormat;
use crate::utils::parse_duration_string;
use crate::yaml_config::{YamlConfigError, YamlRunConfig};

/// Upper bound on execution units in one wave.
pub const MAX_CONCURRENCY: usize = 100_000;

/// Upper bound on results kept in memory for one run.
pub const MAX_TOTAL_REQUESTS: usize = 10_000_000;

/// Errors surfaced before any request is issued.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid value for {var}: {message}")]
    Env { var: String, message: String },

    #[error(transparent)]
    Yaml(#[from] YamlConfigError),

    #[error("HTTP client unavailable: {0}")]
    ClientUnavailable(String),
}

/// How the orchestrator drives load.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionMode {
    /// `concurrency` units, each issuing `requests_per_worker` sequential requests.
    SingleWave { requests_per_worker: usize },

    /// Repeated waves of `concurrency` single requests, with an FD sample
    /// taken after each wave settles.
    MultiRound {
        rounds: usize,
        settle: Duration,
        pause: Duration,
    },
}

impl ExecutionMode {
    /// Requests issued by each unit per wave.
    pub fn requests_per_unit(&self) -> usize {
        match self {
            ExecutionMode::SingleWave {
                requests_per_worker,
            } => *requests_per_worker,
            ExecutionMode::MultiRound { .. } => 1,
        }
    }

    pub fn waves(&self) -> usize {
        match self {
            ExecutionMode::SingleWave { .. } => 1,
            ExecutionMode::MultiRound { rounds, .. } => *rounds,
        }
    }

    /// Results produced by `units` execution units, or `None` on overflow.
    pub fn total_requests(&self, units: usize) -> Option<usize> {
        units
            .checked_mul(self.requests_per_unit())?
            .checked_mul(self.waves())
    }
}

/// Staggered launch of execution units.
///
/// After every `batch_size` spawned units the orchestrator sleeps for
/// `batch_delay`. A `batch_size` of 0 launches everything at once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaunchPolicy {
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl LaunchPolicy {
    pub fn immediate() -> Self {
        Self {
            batch_size: 0,
            batch_delay: Duration::ZERO,
        }
    }

    /// Delay to apply before launching unit `index`, if any.
    pub fn delay_before(&self, index: usize) -> Option<Duration> {
        if self.batch_size == 0 || index == 0 || self.batch_delay.is_zero() {
            return None;
        }
        (index % self.batch_size == 0).then_some(self.batch_delay)
    }
}

impl Default for LaunchPolicy {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_millis(100),
        }
    }
}

/// Main configuration for a test session.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target_url: String,
    pub proxy_addr: String,
    pub concurrency: usize,
    pub requests_per_worker: usize,
    pub rounds: Option<usize>,
    pub round_settle: Duration,
    pub round_pause: Duration,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub hard_timeout_grace: Duration,
    pub backend: ClientBackend,
    pub curl_path: String,
    pub monitor_pid: Option<u32>,
    pub sampler: SamplerKind,
    pub sampler_timeout: Duration,
    pub launch: LaunchPolicy,
    pub success_threshold: f64,
    pub expected_body: Option<String>,
    pub start_fixture: bool,
    pub fixture_addr: SocketAddr,
    pub fd_leak_tolerance: i64,
    pub report_format: ReportFormat,
    pub metrics_port: Option<u16>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target_url: "http://127.0.0.1:9090/".to_string(),
            proxy_addr: "127.0.0.1:1080".to_string(),
            concurrency: 500,
            requests_per_worker: 1,
            rounds: None,
            round_settle: Duration::from_millis(200),
            round_pause: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            total_timeout: Duration::from_secs(10),
            hard_timeout_grace: Duration::from_secs(5),
            backend: ClientBackend::Curl,
            curl_path: "curl".to_string(),
            monitor_pid: None,
            sampler: SamplerKind::Lsof,
            sampler_timeout: Duration::from_secs(5),
            launch: LaunchPolicy::default(),
            success_threshold: 0.9,
            expected_body: None,
            start_fixture: false,
            fixture_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            fd_leak_tolerance: 10,
            report_format: ReportFormat::Text,
            metrics_port: None,
        }
    }
}

impl RunConfig {
    /// Creates a configuration with defaults for everything but the endpoints.
    pub fn new(target_url: impl Into<String>, proxy_addr: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            proxy_addr: proxy_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_requests_per_worker(mut self, requests: usize) -> Self {
        self.requests_per_worker = requests;
        self
    }

    /// Switch to multi-round mode.
    pub fn with_rounds(mut self, rounds: usize) -> Self {
        self.rounds = Some(rounds);
        self
    }

    pub fn with_round_pauses(mut self, settle: Duration, pause: Duration) -> Self {
        self.round_settle = settle;
        self.round_pause = pause;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, total: Duration) -> Self {
        self.connect_timeout = connect;
        self.total_timeout = total;
        self
    }

    pub fn with_backend(mut self, backend: ClientBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_monitor_pid(mut self, pid: u32, sampler: SamplerKind) -> Self {
        self.monitor_pid = Some(pid);
        self.sampler = sampler;
        self
    }

    pub fn with_launch(mut self, launch: LaunchPolicy) -> Self {
        self.launch = launch;
        self
    }

    pub fn with_expected_body(mut self, body: impl Into<String>) -> Self {
        self.expected_body = Some(body.into());
        self
    }

    /// Loads configuration from `CONFIG_FILE` (if set) and environment variables.
    ///
    /// Precedence: env > yaml > defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_pid_arg(None)
    }

    /// Like [`RunConfig::from_env`], with the monitored PID optionally given on
    /// the command line (it wins over `MONITOR_PID`).
    pub fn from_env_with_pid_arg(pid_arg: Option<String>) -> Result<Self, ConfigError> {
        let mut config = match env::var("CONFIG_FILE") {
            Ok(path) if !path.trim().is_empty() => {
                YamlRunConfig::from_file(path.trim())?.apply_to(RunConfig::default())?
            }
            _ => RunConfig::default(),
        };

        if let Some(v) = env_string("TARGET_URL") {
            config.target_url = v;
        }
        if let Some(v) = env_string("PROXY_ADDR") {
            config.proxy_addr = v;
        }
        if let Some(v) = env_parse("CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(v) = env_parse("REQUESTS_PER_WORKER")? {
            config.requests_per_worker = v;
        }
        if let Some(v) = env_parse("ROUNDS")? {
            config.rounds = Some(v);
        }
        if let Some(v) = env_duration("ROUND_SETTLE")? {
            config.round_settle = v;
        }
        if let Some(v) = env_duration("ROUND_PAUSE")? {
            config.round_pause = v;
        }
        if let Some(v) = env_duration("CONNECT_TIMEOUT")? {
            config.connect_timeout = v;
        }
        if let Some(v) = env_duration("MAX_TIME")? {
            config.total_timeout = v;
        }
        if let Some(v) = env_duration("HARD_TIMEOUT_GRACE")? {
            config.hard_timeout_grace = v;
        }
        if let Some(v) = env_parse("CLIENT_BACKEND")? {
            config.backend = v;
        }
        if let Some(v) = env_string("CURL_PATH") {
            config.curl_path = v;
        }
        if let Some(v) = env_parse("MONITOR_PID")? {
            config.monitor_pid = Some(v);
        }
        if let Some(v) = env_parse("FD_SAMPLER")? {
            config.sampler = v;
        }
        if let Some(v) = env_duration("SAMPLER_TIMEOUT")? {
            config.sampler_timeout = v;
        }
        if let Some(v) = env_parse("LAUNCH_BATCH_SIZE")? {
            config.launch.batch_size = v;
        }
        if let Some(v) = env_duration("LAUNCH_BATCH_DELAY")? {
            config.launch.batch_delay = v;
        }
        if let Some(v) = env_parse("SUCCESS_THRESHOLD")? {
            config.success_threshold = v;
        }
        if let Some(v) = env_string("EXPECTED_BODY") {
            config.expected_body = Some(v);
        }
        if let Some(v) = env_parse::<String>("START_FIXTURE")? {
            config.start_fixture = v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = env_parse("FIXTURE_ADDR")? {
            config.fixture_addr = v;
        }
        if let Some(v) = env_parse("FD_LEAK_TOLERANCE")? {
            config.fd_leak_tolerance = v;
        }
        if let Some(v) = env_parse("REPORT_FORMAT")? {
            config.report_format = v;
        }
        if let Some(v) = env_parse("METRICS_PORT")? {
            config.metrics_port = Some(v);
        }

        if let Some(arg) = pid_arg {
            let pid = arg.trim().parse::<u32>().map_err(|e| ConfigError::Env {
                var: "PID argument".to_string(),
                message: format!("'{}' is not a process id: {}", arg, e),
            })?;
            config.monitor_pid = Some(pid);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks every field, reporting all violations at once.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut ctx = ValidationContext::new();

        ctx.check(UrlValidator::validate(&self.target_url, "target_url"));
        ctx.check(ProxyAddrValidator::validate(&self.proxy_addr, "proxy_addr"));
        ctx.check(RangeValidator::validate_u64(
            self.concurrency as u64,
            1,
            MAX_CONCURRENCY as u64,
            "concurrency",
        ));
        ctx.check(RangeValidator::validate_positive_u64(
            self.requests_per_worker as u64,
            "requests_per_worker",
        ));
        if let Some(rounds) = self.rounds {
            ctx.check(RangeValidator::validate_positive_u64(rounds as u64, "rounds"));
        }
        match self.mode().total_requests(self.concurrency) {
            Some(total) if total > MAX_TOTAL_REQUESTS => ctx.field_error(
                "total_requests",
                format!("{} exceeds the limit of {}", total, MAX_TOTAL_REQUESTS),
            ),
            None => ctx.field_error(
                "total_requests",
                "concurrency x requests per unit x rounds overflows".to_string(),
            ),
            Some(_) => {}
        }
        ctx.check(DurationValidator::validate_positive(
            self.connect_timeout,
            "connect_timeout",
        ));
        ctx.check(DurationValidator::validate_positive(
            self.total_timeout,
            "total_timeout",
        ));
        ctx.check(DurationValidator::validate_not_longer(
            self.connect_timeout,
            "connect_timeout",
            self.total_timeout,
            "total_timeout",
        ));
        ctx.check(DurationValidator::validate_positive(
            self.sampler_timeout,
            "sampler_timeout",
        ));
        ctx.check(RangeValidator::validate_f64(
            self.success_threshold,
            0.0,
            1.0,
            "success_threshold",
        ));
        if self.fd_leak_tolerance < 0 {
            ctx.field_error(
                "fd_leak_tolerance",
                format!("must be non-negative, got {}", self.fd_leak_tolerance),
            );
        }
        if self.curl_path.trim().is_empty() && self.backend == ClientBackend::Curl {
            ctx.field_error("curl_path", "cannot be empty".to_string());
        }

        ctx.into_result()
    }

    /// The execution mode selected by this configuration.
    pub fn mode(&self) -> ExecutionMode {
        match self.rounds {
            Some(rounds) => ExecutionMode::MultiRound {
                rounds,
                settle: self.round_settle,
                pause: self.round_pause,
            },
            None => ExecutionMode::SingleWave {
                requests_per_worker: self.requests_per_worker,
            },
        }
    }

    /// Total number of results the run must produce, saturating at
    /// `usize::MAX` for configurations that fail validation.
    pub fn total_requests(&self) -> usize {
        self.mode()
            .total_requests(self.concurrency)
            .unwrap_or(usize::MAX)
    }

    /// Creates a ClientConfig from this RunConfig.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            backend: self.backend,
            curl_path: self.curl_path.clone(),
            proxy_addr: self.proxy_addr.clone(),
            connect_timeout: self.connect_timeout,
            total_timeout: self.total_timeout,
        }
    }

    /// Per-request parameters handed to the request driver.
    pub fn request_spec(&self) -> RequestSpec {
        RequestSpec {
            proxy_addr: self.proxy_addr.clone(),
            target_url: self.target_url.clone(),
            connect_timeout: self.connect_timeout,
            total_timeout: self.total_timeout,
            capture_body: self.expected_body.is_some(),
        }
    }

    /// Prints the configuration summary.
    pub fn print_summary(&self) {
        println!("Starting proxy load test:");
        println!("  Target URL: {}", self.target_url);
        println!("  SOCKS5 Proxy: {}", self.proxy_addr);
        println!("  Client Backend: {}", self.backend);
        println!("  Concurrency: {}", self.concurrency);
        match self.mode() {
            ExecutionMode::SingleWave {
                requests_per_worker,
            } => {
                println!(
                    "  Mode: single wave ({} requests per worker, {} total)",
                    requests_per_worker,
                    self.total_requests()
                );
            }
            ExecutionMode::MultiRound {
                rounds,
                settle,
                pause,
            } => {
                println!(
                    "  Mode: {} rounds x {} requests (settle {:?}, pause {:?})",
                    rounds, self.concurrency, settle, pause
                );
            }
        }
        println!(
            "  Timeouts: connect {:?}, total {:?}",
            self.connect_timeout, self.total_timeout
        );
        match self.monitor_pid {
            Some(pid) => println!("  Monitored PID: {} (sampler: {})", pid, self.sampler),
            None => println!("  Monitored PID: none (FD sampling disabled)"),
        }
        println!(
            "  Success Threshold: {:.1}%",
            self.success_threshold * 100.0
        );
        if self.start_fixture {
            println!("  Target Fixture: {}", self.fixture_addr);
        }
    }
}

fn env_string(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env_string(var) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Env {
                var: var.to_string(),
                message: format!("'{}': {}", raw, e),
            }),
        None => Ok(None),
    }
}

fn env_duration(var: &str) -> Result<Option<Duration>, ConfigError> {
    match env_string(var) {
        Some(raw) => parse_duration_string(&raw)
            .map(Some)
            .map_err(|message| ConfigError::Env {
                var: var.to_string(),
                message,
            }),
        None => Ok(None),
    }
}
