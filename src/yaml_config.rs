//! YAML configuration file support.
//!
//! A YAML file carries the same settings as the environment variables and is
//! loaded first; environment variables then override individual fields.
//!
//! ```yaml
//! targetUrl: "http://127.0.0.1:9090/"
//! proxy: "127.0.0.1:1080"
//! concurrency: 50
//! rounds: 20
//! timeouts:
//!   connect: "5s"
//!   total: "10s"
//! monitorPid: 4242
//! backend: curl
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration as StdDuration;
use thiserror::Error;

use crate::client::ClientBackend;
use crate::config::RunConfig;
use crate::fd_sampler::SamplerKind;

/// Errors that can occur when loading or parsing YAML configuration.
#[derive(Error, Debug)]
pub enum YamlConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Duration format for YAML (e.g., `30`, `"250ms"`, `"5s"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlDuration {
    Seconds(u64),
    String(String),
}

impl YamlDuration {
    pub fn to_std_duration(&self) -> Result<StdDuration, YamlConfigError> {
        match self {
            YamlDuration::Seconds(s) => Ok(StdDuration::from_secs(*s)),
            YamlDuration::String(s) => crate::utils::parse_duration_string(s)
                .map_err(|e| YamlConfigError::Validation(format!("Invalid duration '{}': {}", s, e))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlTimeouts {
    pub connect: Option<YamlDuration>,
    pub total: Option<YamlDuration>,
    pub grace: Option<YamlDuration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct YamlLaunch {
    pub batch_size: Option<usize>,
    pub batch_delay: Option<YamlDuration>,
}

/// Run configuration as written in a YAML file. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct YamlRunConfig {
    pub target_url: Option<String>,
    pub proxy: Option<String>,
    pub concurrency: Option<usize>,
    pub requests_per_worker: Option<usize>,
    pub rounds: Option<usize>,
    pub round_settle: Option<YamlDuration>,
    pub round_pause: Option<YamlDuration>,
    #[serde(default)]
    pub timeouts: YamlTimeouts,
    pub backend: Option<String>,
    pub curl_path: Option<String>,
    pub monitor_pid: Option<u32>,
    pub fd_sampler: Option<String>,
    #[serde(default)]
    pub launch: YamlLaunch,
    pub success_threshold: Option<f64>,
    pub expected_body: Option<String>,
    pub fd_leak_tolerance: Option<i64>,
}

impl YamlRunConfig {
    /// Parse configuration from a YAML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(yaml: &str) -> Result<Self, YamlConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, YamlConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Overlay the fields present in this file onto `base`.
    ///
    /// Range checks are left to `RunConfig::validate`; only values that cannot
    /// be represented at all (bad durations, unknown backends) fail here.
    pub fn apply_to(self, mut base: RunConfig) -> Result<RunConfig, YamlConfigError> {
        if let Some(v) = self.target_url {
            base.target_url = v;
        }
        if let Some(v) = self.proxy {
            base.proxy_addr = v;
        }
        if let Some(v) = self.concurrency {
            base.concurrency = v;
        }
        if let Some(v) = self.requests_per_worker {
            base.requests_per_worker = v;
        }
        if let Some(v) = self.rounds {
            base.rounds = Some(v);
        }
        if let Some(v) = self.round_settle {
            base.round_settle = v.to_std_duration()?;
        }
        if let Some(v) = self.round_pause {
            base.round_pause = v.to_std_duration()?;
        }
        if let Some(v) = self.timeouts.connect {
            base.connect_timeout = v.to_std_duration()?;
        }
        if let Some(v) = self.timeouts.total {
            base.total_timeout = v.to_std_duration()?;
        }
        if let Some(v) = self.timeouts.grace {
            base.hard_timeout_grace = v.to_std_duration()?;
        }
        if let Some(v) = self.backend {
            base.backend = v
                .parse::<ClientBackend>()
                .map_err(|e| YamlConfigError::Validation(e.to_string()))?;
        }
        if let Some(v) = self.curl_path {
            base.curl_path = v;
        }
        if let Some(v) = self.monitor_pid {
            base.monitor_pid = Some(v);
        }
        if let Some(v) = self.fd_sampler {
            base.sampler = v
                .parse::<SamplerKind>()
                .map_err(|e| YamlConfigError::Validation(e.to_string()))?;
        }
        if let Some(v) = self.launch.batch_size {
            base.launch.batch_size = v;
        }
        if let Some(v) = self.launch.batch_delay {
            base.launch.batch_delay = v.to_std_duration()?;
        }
        if let Some(v) = self.success_threshold {
            base.success_threshold = v;
        }
        if let Some(v) = self.expected_body {
            base.expected_body = Some(v);
        }
        if let Some(v) = self.fd_leak_tolerance {
            base.fd_leak_tolerance = v;
        }
        Ok(base)
    }
}
