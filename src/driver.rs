//! Issues one proxied request and turns whatever happened into a
//! [`RequestResult`].
//!
//! `execute` never returns an error: spawn failures, timeouts, and garbage
//! output all become failed results, so one bad request cannot abort a
//! concurrent batch.

use std::sync::Arc;

use tokio::time::{self, Duration};
use tracing::debug;

use crate::client::{ClientOutput, RequestClient, RequestSpec};
use crate::errors::OutcomeKind;
use crate::result::RequestResult;

/// The three machine-readable fields of a completed exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteOut {
    pub status_code: u16,
    pub total_time: f64,
    pub connect_time: f64,
}

/// Parses `status_code|total_time|connect_time`.
///
/// Anything other than exactly three well-formed fields (integer status,
/// finite non-negative times) is rejected.
pub fn parse_write_out(raw: &str) -> Option<WriteOut> {
    let mut fields = raw.trim().split('|');
    let status = fields.next()?.trim();
    let total = fields.next()?.trim();
    let connect = fields.next()?.trim();
    if fields.next().is_some() {
        return None;
    }

    if status.is_empty() || !status.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let status_code = status.parse::<u16>().ok()?;
    let total_time = parse_seconds(total)?;
    let connect_time = parse_seconds(connect)?;

    Some(WriteOut {
        status_code,
        total_time,
        connect_time,
    })
}

fn parse_seconds(raw: &str) -> Option<f64> {
    let value = raw.parse::<f64>().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Runs requests through a [`RequestClient`].
pub struct RequestDriver {
    client: Arc<dyn RequestClient>,
    hard_timeout_grace: Duration,
    expected_body: Option<Vec<u8>>,
}

impl RequestDriver {
    /// `hard_timeout_grace` is added to each request's total timeout to form
    /// the driver's own outer bound, for clients that can hang past theirs.
    pub fn new(client: Arc<dyn RequestClient>, hard_timeout_grace: Duration) -> Self {
        Self {
            client,
            hard_timeout_grace,
            expected_body: None,
        }
    }

    /// Require successful responses to carry exactly this body.
    pub fn with_expected_body(mut self, body: Option<Vec<u8>>) -> Self {
        self.expected_body = body;
        self
    }

    pub fn client_name(&self) -> &'static str {
        self.client.name()
    }

    /// Outer deadline for one request.
    pub fn hard_timeout(&self, spec: &RequestSpec) -> Duration {
        spec.total_timeout + self.hard_timeout_grace
    }

    /// Issue one request. Never fails; every failure path is a result.
    pub async fn execute(&self, spec: &RequestSpec) -> RequestResult {
        let hard_timeout = self.hard_timeout(spec);

        match time::timeout(hard_timeout, self.client.fetch(spec)).await {
            Err(_) => {
                debug!(
                    client = self.client.name(),
                    hard_timeout_ms = hard_timeout.as_millis() as u64,
                    "Client exceeded hard timeout"
                );
                RequestResult::timeout()
            }
            Ok(Err(e)) => {
                let outcome = OutcomeKind::from_client_error(&e);
                debug!(
                    client = self.client.name(),
                    error = %e,
                    outcome = outcome.label(),
                    "Request failed"
                );
                RequestResult::failed(outcome)
            }
            Ok(Ok(output)) => self.interpret(output),
        }
    }

    fn interpret(&self, output: ClientOutput) -> RequestResult {
        let Some(fields) = parse_write_out(&output.write_out) else {
            debug!(
                client = self.client.name(),
                output = %output.write_out.trim(),
                "Malformed client output"
            );
            return RequestResult::protocol_failure();
        };

        let result =
            RequestResult::from_response(fields.status_code, fields.total_time, fields.connect_time);

        if result.is_success() {
            if let Some(expected) = &self.expected_body {
                if output.body.as_deref() != Some(expected.as_slice()) {
                    debug!(
                        client = self.client.name(),
                        status_code = fields.status_code,
                        "Response body does not match expected payload"
                    );
                    return RequestResult::protocol_failure();
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ClientError;
    use async_trait::async_trait;

    /// Client returning a canned response.
    struct CannedClient {
        response: fn() -> Result<ClientOutput, ClientError>,
        delay: Duration,
    }

    #[async_trait]
    impl RequestClient for CannedClient {
        fn name(&self) -> &'static str {
            "canned"
        }

        async fn fetch(&self, _spec: &RequestSpec) -> Result<ClientOutput, ClientError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.response)()
        }
    }

    fn driver(response: fn() -> Result<ClientOutput, ClientError>) -> RequestDriver {
        RequestDriver::new(
            Arc::new(CannedClient {
                response,
                delay: Duration::ZERO,
            }),
            Duration::from_secs(1),
        )
    }

    fn spec() -> RequestSpec {
        RequestSpec {
            proxy_addr: "127.0.0.1:1080".to_string(),
            target_url: "http://127.0.0.1:9090/".to_string(),
            connect_timeout: Duration::from_secs(1),
            total_timeout: Duration::from_secs(2),
            capture_body: false,
        }
    }

    fn line(s: &str) -> Result<ClientOutput, ClientError> {
        Ok(ClientOutput {
            write_out: s.to_string(),
            body: None,
        })
    }

    #[test]
    fn parse_well_formed_line() {
        let w = parse_write_out("200|0.012345|0.001200").unwrap();
        assert_eq!(w.status_code, 200);
        assert_eq!(w.total_time, 0.012345);
        assert_eq!(w.connect_time, 0.0012);
    }

    #[test]
    fn parse_tolerates_surrounding_whitespace() {
        assert!(parse_write_out("  404|1.5|0.2\n").is_some());
    }

    #[test]
    fn parse_rejects_wrong_field_count() {
        assert!(parse_write_out("200|0.5").is_none());
        assert!(parse_write_out("200|0.5|0.1|9").is_none());
        assert!(parse_write_out("").is_none());
    }

    #[test]
    fn parse_rejects_non_numeric_fields() {
        assert!(parse_write_out("abc|0.5|0.1").is_none());
        assert!(parse_write_out("200|fast|0.1").is_none());
        assert!(parse_write_out("200|0.5|-0.1").is_none());
        assert!(parse_write_out("200|NaN|0.1").is_none());
        assert!(parse_write_out("+200|0.5|0.1").is_none());
    }

    #[tokio::test]
    async fn success_line_becomes_success_result() {
        let r = driver(|| line("200|0.050|0.010")).execute(&spec()).await;
        assert!(r.is_success());
        assert_eq!(r.status_code(), 200);
        assert_eq!(r.total_time(), 0.05);
        assert_eq!(r.connect_time(), 0.01);
    }

    #[tokio::test]
    async fn two_fields_is_protocol_failure() {
        let r = driver(|| line("200|0.050")).execute(&spec()).await;
        assert_eq!(r.outcome(), OutcomeKind::ProtocolFailure);
        assert_eq!(r.status_code(), 0);
    }

    #[tokio::test]
    async fn curl_zero_status_is_transport_error() {
        let r = driver(|| line("000|0.001|0.000")).execute(&spec()).await;
        assert_eq!(r.outcome(), OutcomeKind::TransportError);
        assert_eq!(r.status_code(), 0);
    }

    #[tokio::test]
    async fn client_timeout_is_timeout() {
        let r = driver(|| Err(ClientError::Timeout(Duration::from_secs(2))))
            .execute(&spec())
            .await;
        assert_eq!(r.outcome(), OutcomeKind::Timeout);
        assert_eq!(r.status_code(), 0);
    }

    #[tokio::test]
    async fn client_exit_is_transport_error() {
        let r = driver(|| {
            Err(ClientError::Exit {
                code: 7,
                stderr: "Failed to connect".to_string(),
            })
        })
        .execute(&spec())
        .await;
        assert_eq!(r.outcome(), OutcomeKind::TransportError);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_client_is_cut_off_by_hard_timeout() {
        let driver = RequestDriver::new(
            Arc::new(CannedClient {
                response: || line("200|0.1|0.1"),
                delay: Duration::from_secs(60),
            }),
            Duration::from_millis(500),
        );
        assert_eq!(driver.hard_timeout(&spec()), Duration::from_millis(2500));

        let r = driver.execute(&spec()).await;
        assert_eq!(r.outcome(), OutcomeKind::Timeout);
    }

    #[tokio::test]
    async fn body_mismatch_is_protocol_failure() {
        let d = driver(|| {
            Ok(ClientOutput {
                write_out: "200|0.01|0.001".to_string(),
                body: Some(b"something else".to_vec()),
            })
        })
        .with_expected_body(Some(b"Hello from SOCKS5 test server!".to_vec()));

        let r = d.execute(&spec()).await;
        assert_eq!(r.outcome(), OutcomeKind::ProtocolFailure);
        assert_eq!(r.status_code(), 0);
    }

    #[tokio::test]
    async fn body_match_keeps_success() {
        let d = driver(|| {
            Ok(ClientOutput {
                write_out: "200|0.01|0.001".to_string(),
                body: Some(b"Hello from SOCKS5 test server!".to_vec()),
            })
        })
        .with_expected_body(Some(b"Hello from SOCKS5 test server!".to_vec()));

        assert!(d.execute(&spec()).await.is_success());
    }

    #[tokio::test]
    async fn non_success_status_skips_body_check() {
        let d = driver(|| line("503|0.01|0.001"))
            .with_expected_body(Some(b"expected".to_vec()));

        let r = d.execute(&spec()).await;
        assert_eq!(r.status_code(), 503);
        assert_eq!(r.outcome(), OutcomeKind::ProtocolFailure);
    }
}
