//! HTTP clients that tunnel one request through a SOCKS5 proxy.
//!
//! Both backends honour the same contract: on a completed exchange they emit
//! a machine-readable `status_code|total_time|connect_time` line (curl's
//! `-w` write-out format) and, when asked, the response body. Everything
//! else is a [`ClientError`].

use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{self, Duration, Instant};
use tracing::debug;

use crate::config_validation::ValidationError;
use crate::errors::ClientError;
use crate::utils::format_secs;

/// curl write-out format producing the three machine-readable fields.
pub const WRITE_OUT_FORMAT: &str = "%{http_code}|%{time_total}|%{time_connect}";

/// curl exit code for "operation timed out".
const CURL_EXIT_TIMEOUT: i32 = 28;

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Parameters of a single proxied request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    /// SOCKS5 proxy as `host:port`
    pub proxy_addr: String,
    pub target_url: String,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    /// Keep the response body so the driver can compare it to an expected payload
    pub capture_body: bool,
}

/// Raw output of a completed client invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOutput {
    /// `status_code|total_time|connect_time`, unparsed
    pub write_out: String,
    /// Response body, only when `RequestSpec::capture_body` was set
    pub body: Option<Vec<u8>>,
}

/// The narrow contract the request driver depends on.
#[async_trait]
pub trait RequestClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checks that the client can run at all, before any load is generated.
    async fn preflight(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn fetch(&self, spec: &RequestSpec) -> Result<ClientOutput, ClientError>;
}

/// Which client implementation performs requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientBackend {
    /// External `curl` process per request
    Curl,
    /// In-process reqwest client with SOCKS5 support
    Native,
}

impl FromStr for ClientBackend {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "curl" => Ok(ClientBackend::Curl),
            "native" | "reqwest" => Ok(ClientBackend::Native),
            other => Err(ValidationError::InvalidEnum {
                field: "client_backend".to_string(),
                value: other.to_string(),
                expected: "curl, native".to_string(),
            }),
        }
    }
}

impl fmt::Display for ClientBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientBackend::Curl => write!(f, "curl"),
            ClientBackend::Native => write!(f, "native"),
        }
    }
}

/// Configuration for building the request client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub backend: ClientBackend,
    pub curl_path: String,
    pub proxy_addr: String,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
}

/// Builds the configured request client.
pub fn build_client(config: &ClientConfig) -> Result<Arc<dyn RequestClient>, ClientError> {
    match config.backend {
        ClientBackend::Curl => Ok(Arc::new(CurlClient::new(config.curl_path.clone()))),
        ClientBackend::Native => Ok(Arc::new(NativeClient::new(
            &config.proxy_addr,
            config.connect_timeout,
            config.total_timeout,
        )?)),
    }
}

/// Runs one `curl` process per request.
#[derive(Debug, Clone)]
pub struct CurlClient {
    program: String,
}

impl CurlClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Command-line arguments for one request.
    pub fn args(spec: &RequestSpec) -> Vec<String> {
        let mut args = vec![
            "--socks5".to_string(),
            spec.proxy_addr.clone(),
            "--connect-timeout".to_string(),
            format_secs(spec.connect_timeout),
            "--max-time".to_string(),
            format_secs(spec.total_timeout),
            "-s".to_string(),
        ];

        if spec.capture_body {
            // Body goes to stdout; the write-out follows on its own line.
            args.push("-w".to_string());
            args.push(format!("\n{}", WRITE_OUT_FORMAT));
        } else {
            args.push("-o".to_string());
            args.push(NULL_DEVICE.to_string());
            args.push("-w".to_string());
            args.push(WRITE_OUT_FORMAT.to_string());
        }

        args.push(spec.target_url.clone());
        args
    }
}

#[async_trait]
impl RequestClient for CurlClient {
    fn name(&self) -> &'static str {
        "curl"
    }

    async fn preflight(&self) -> Result<(), ClientError> {
        let status = time::timeout(
            Duration::from_secs(5),
            Command::new(&self.program)
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await
        .map_err(|_| ClientError::Timeout(Duration::from_secs(5)))?
        .map_err(|source| ClientError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(ClientError::Exit {
                code,
                stderr: format!("'{} --version' failed", self.program),
            }),
            None => Err(ClientError::Signaled),
        }
    }

    async fn fetch(&self, spec: &RequestSpec) -> Result<ClientOutput, ClientError> {
        let output = Command::new(&self.program)
            .args(Self::args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ClientError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        match output.status.code() {
            Some(0) => Ok(split_curl_stdout(&output.stdout, spec.capture_body)),
            Some(CURL_EXIT_TIMEOUT) => Err(ClientError::Timeout(spec.total_timeout)),
            Some(code) => Err(ClientError::Exit {
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            None => Err(ClientError::Signaled),
        }
    }
}

/// Separate curl's stdout into body (if captured) and the write-out line.
pub fn split_curl_stdout(stdout: &[u8], capture_body: bool) -> ClientOutput {
    if !capture_body {
        return ClientOutput {
            write_out: String::from_utf8_lossy(stdout).into_owned(),
            body: None,
        };
    }

    match stdout.iter().rposition(|b| *b == b'\n') {
        Some(pos) => ClientOutput {
            write_out: String::from_utf8_lossy(&stdout[pos + 1..]).into_owned(),
            body: Some(stdout[..pos].to_vec()),
        },
        // No separator: there is no body, and the line is probably malformed.
        None => ClientOutput {
            write_out: String::from_utf8_lossy(stdout).into_owned(),
            body: Some(Vec::new()),
        },
    }
}

/// In-process client routing every request through the SOCKS5 proxy.
///
/// Idle pooling is disabled so each request performs its own SOCKS5
/// handshake and releases its connection when done, the same way a curl
/// process per request would. Redirects are not followed, so a relayed 3xx is
/// reported as observed. Connect time is not observable through reqwest and
/// is reported as unmeasured (0.0).
#[derive(Debug, Clone)]
pub struct NativeClient {
    client: reqwest::Client,
    proxy_addr: String,
    connect_timeout: Duration,
}

impl NativeClient {
    pub fn new(
        proxy_addr: &str,
        connect_timeout: Duration,
        total_timeout: Duration,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            client: socks_client(proxy_addr, connect_timeout, total_timeout)?,
            proxy_addr: proxy_addr.to_string(),
            connect_timeout,
        })
    }

    /// The shared client when `spec` matches what it was built for, otherwise
    /// a one-off client for the requested proxy and connect timeout.
    fn client_for(&self, spec: &RequestSpec) -> Result<reqwest::Client, ClientError> {
        if spec.proxy_addr == self.proxy_addr && spec.connect_timeout == self.connect_timeout {
            return Ok(self.client.clone());
        }
        debug!(
            proxy = %spec.proxy_addr,
            connect_timeout_ms = spec.connect_timeout.as_millis() as u64,
            "Building client for a request-specific proxy"
        );
        socks_client(&spec.proxy_addr, spec.connect_timeout, spec.total_timeout)
    }
}

fn socks_client(
    proxy_addr: &str,
    connect_timeout: Duration,
    total_timeout: Duration,
) -> Result<reqwest::Client, ClientError> {
    let proxy = reqwest::Proxy::all(format!("socks5://{}", proxy_addr))
        .map_err(|e| ClientError::Build(e.to_string()))?;

    reqwest::Client::builder()
        .proxy(proxy)
        .connect_timeout(connect_timeout)
        .timeout(total_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(0)
        .build()
        .map_err(|e| ClientError::Build(e.to_string()))
}

#[async_trait]
impl RequestClient for NativeClient {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn fetch(&self, spec: &RequestSpec) -> Result<ClientOutput, ClientError> {
        let client = self.client_for(spec)?;
        let total_timeout = spec.total_timeout;
        let start = Instant::now();

        let mut response = client
            .get(&spec.target_url)
            .timeout(total_timeout)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(&e, total_timeout))?;

        let status = response.status().as_u16();

        let body = if spec.capture_body {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ClientError::from_reqwest(&e, total_timeout))?;
            Some(bytes.to_vec())
        } else {
            // Drain without buffering so the connection can be released.
            while let Some(_chunk) = response
                .chunk()
                .await
                .map_err(|e| ClientError::from_reqwest(&e, total_timeout))?
            {}
            None
        };

        let total = start.elapsed().as_secs_f64();
        debug!(status_code = status, total_secs = total, "Native request completed");

        Ok(ClientOutput {
            write_out: format!("{}|{:.6}|{:.6}", status, total, 0.0),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(capture_body: bool) -> RequestSpec {
        RequestSpec {
            proxy_addr: "127.0.0.1:1080".to_string(),
            target_url: "http://127.0.0.1:9090/".to_string(),
            connect_timeout: Duration::from_secs(5),
            total_timeout: Duration::from_secs(10),
            capture_body,
        }
    }

    #[test]
    fn curl_args_route_through_socks5_with_timeouts() {
        let args = CurlClient::args(&spec(false));
        let joined = args.join(" ");
        assert!(joined.starts_with("--socks5 127.0.0.1:1080"));
        assert!(joined.contains("--connect-timeout 5.000"));
        assert!(joined.contains("--max-time 10.000"));
        assert!(args.contains(&"-s".to_string()));
        assert!(args.contains(&"-o".to_string()));
        assert!(args.contains(&WRITE_OUT_FORMAT.to_string()));
        assert_eq!(args.last().unwrap(), "http://127.0.0.1:9090/");
    }

    #[test]
    fn curl_args_keep_body_when_capturing() {
        let args = CurlClient::args(&spec(true));
        assert!(!args.contains(&"-o".to_string()));
        assert!(args.contains(&format!("\n{}", WRITE_OUT_FORMAT)));
    }

    #[test]
    fn split_without_body() {
        let out = split_curl_stdout(b"200|0.012|0.003", false);
        assert_eq!(out.write_out, "200|0.012|0.003");
        assert!(out.body.is_none());
    }

    #[test]
    fn split_with_body() {
        let out = split_curl_stdout(b"Hello from SOCKS5 test server!\n200|0.012|0.003", true);
        assert_eq!(out.write_out, "200|0.012|0.003");
        assert_eq!(out.body.unwrap(), b"Hello from SOCKS5 test server!".to_vec());
    }

    #[test]
    fn split_body_containing_newlines() {
        let out = split_curl_stdout(b"line1\nline2\n\n404|0.1|0.05", true);
        assert_eq!(out.write_out, "404|0.1|0.05");
        assert_eq!(out.body.unwrap(), b"line1\nline2\n".to_vec());
    }

    #[test]
    fn backend_parsing() {
        assert_eq!("curl".parse::<ClientBackend>().unwrap(), ClientBackend::Curl);
        assert_eq!(
            "Native".parse::<ClientBackend>().unwrap(),
            ClientBackend::Native
        );
        match "wget".parse::<ClientBackend>() {
            Err(ValidationError::InvalidEnum { field, value, .. }) => {
                assert_eq!(field, "client_backend");
                assert_eq!(value, "wget");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(ClientBackend::Native.to_string(), "native");
    }

    #[test]
    fn native_client_builds_with_socks_proxy() {
        let client = NativeClient::new(
            "127.0.0.1:1080",
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn missing_curl_binary_is_a_spawn_error() {
        let client = CurlClient::new("/nonexistent/bin/curl-for-tests");
        let err = client.fetch(&spec(false)).await.unwrap_err();
        assert!(matches!(err, ClientError::Spawn { .. }));
        assert!(client.preflight().await.is_err());
    }
}
