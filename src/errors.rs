//! Outcome classification for proxied requests.
//!
//! Every request attempt ends in exactly one [`OutcomeKind`]. Failures are
//! partitioned by cause so the report can tell a proxy that answers badly
//! apart from one that hangs or refuses connections.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Mutually exclusive outcome of a single request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// HTTP 2xx or 3xx response
    Success,

    /// Client ran but its output was unusable, or the response was not acceptable
    ProtocolFailure,

    /// Client-enforced (or driver-enforced) timeout elapsed
    Timeout,

    /// Client could not run, or no response was obtained at all
    TransportError,
}

impl OutcomeKind {
    /// Classify an HTTP status code.
    ///
    /// 2xx/3xx is a success. Any other real HTTP status means the proxy relayed
    /// a response that is not acceptable. Codes outside 100..=599 (including
    /// curl's `000`) mean no valid response was obtained.
    pub fn from_status_code(status_code: u16) -> Self {
        match status_code {
            200..=399 => OutcomeKind::Success,
            100..=599 => OutcomeKind::ProtocolFailure,
            _ => OutcomeKind::TransportError,
        }
    }

    /// Classify a client invocation failure.
    pub fn from_client_error(error: &ClientError) -> Self {
        match error {
            ClientError::Timeout(_) => OutcomeKind::Timeout,
            _ => OutcomeKind::TransportError,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeKind::Success)
    }

    /// Get the Prometheus label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::ProtocolFailure => "protocol_failure",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::TransportError => "transport_error",
        }
    }

    /// Get a human-readable description of this outcome.
    pub fn description(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "Successful (2xx/3xx)",
            OutcomeKind::ProtocolFailure => "Protocol failures",
            OutcomeKind::Timeout => "Timeouts",
            OutcomeKind::TransportError => "Transport errors",
        }
    }

    /// Get all outcomes in a consistent order.
    pub fn all() -> [OutcomeKind; 4] {
        [
            OutcomeKind::Success,
            OutcomeKind::ProtocolFailure,
            OutcomeKind::Timeout,
            OutcomeKind::TransportError,
        ]
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Failure of the underlying HTTP client.
///
/// Never escapes the request driver: it is always folded into a failed
/// `RequestResult` so that one bad request cannot abort a batch.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("client exited with code {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("client was terminated by a signal")]
    Signaled,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to build client: {0}")]
    Build(String),
}

impl ClientError {
    /// Categorize a reqwest error from the native backend.
    pub fn from_reqwest(error: &reqwest::Error, total_timeout: Duration) -> Self {
        if error.is_timeout() {
            ClientError::Timeout(total_timeout)
        } else if error.is_connect() {
            ClientError::Connect(error.to_string())
        } else if error.is_builder() {
            ClientError::Build(error.to_string())
        } else {
            let error_msg = error.to_string().to_lowercase();
            if error_msg.contains("timed out") || error_msg.contains("timeout") {
                ClientError::Timeout(total_timeout)
            } else {
                ClientError::Transport(error.to_string())
            }
        }
    }
}

/// Helper to name common HTTP status codes for display.
pub fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        0 => "No Response",

        // 2xx Success
        200 => "OK",
        201 => "Created",
        204 => "No Content",

        // 3xx Redirection
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",

        // 4xx Client Errors
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        429 => "Too Many Requests",

        // 5xx Server Errors
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",

        _ => "Unknown Status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_codes() {
        assert_eq!(OutcomeKind::from_status_code(200), OutcomeKind::Success);
        assert_eq!(OutcomeKind::from_status_code(204), OutcomeKind::Success);
        assert_eq!(OutcomeKind::from_status_code(301), OutcomeKind::Success);
        assert_eq!(OutcomeKind::from_status_code(399), OutcomeKind::Success);
    }

    #[test]
    fn test_http_errors_are_protocol_failures() {
        assert_eq!(
            OutcomeKind::from_status_code(404),
            OutcomeKind::ProtocolFailure
        );
        assert_eq!(
            OutcomeKind::from_status_code(502),
            OutcomeKind::ProtocolFailure
        );
        assert_eq!(
            OutcomeKind::from_status_code(101),
            OutcomeKind::ProtocolFailure
        );
    }

    #[test]
    fn test_no_response_codes_are_transport_errors() {
        assert_eq!(
            OutcomeKind::from_status_code(0),
            OutcomeKind::TransportError
        );
        assert_eq!(
            OutcomeKind::from_status_code(600),
            OutcomeKind::TransportError
        );
    }

    #[test]
    fn test_client_error_classification() {
        let timeout = ClientError::Timeout(Duration::from_secs(10));
        assert_eq!(OutcomeKind::from_client_error(&timeout), OutcomeKind::Timeout);

        let exit = ClientError::Exit {
            code: 7,
            stderr: "Failed to connect".to_string(),
        };
        assert_eq!(
            OutcomeKind::from_client_error(&exit),
            OutcomeKind::TransportError
        );

        let spawn = ClientError::Spawn {
            program: "curl".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(
            OutcomeKind::from_client_error(&spawn),
            OutcomeKind::TransportError
        );
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(OutcomeKind::Success.label(), "success");
        assert_eq!(OutcomeKind::ProtocolFailure.label(), "protocol_failure");
        assert_eq!(OutcomeKind::Timeout.label(), "timeout");
        assert_eq!(OutcomeKind::TransportError.label(), "transport_error");
    }

    #[test]
    fn test_all_outcomes_ordered() {
        let all = OutcomeKind::all();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0], OutcomeKind::Success);
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Exit {
            code: 97,
            stderr: "proxy handshake error".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("97"));
        assert!(display.contains("proxy handshake error"));
    }

    #[test]
    fn test_categorize_status_code_names() {
        assert_eq!(categorize_status_code(0), "No Response");
        assert_eq!(categorize_status_code(200), "OK");
        assert_eq!(categorize_status_code(502), "Bad Gateway");
        assert_eq!(categorize_status_code(799), "Unknown Status");
    }
}
