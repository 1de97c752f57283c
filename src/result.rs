//! Per-request outcome record.

use serde::Serialize;

use crate::errors::OutcomeKind;

/// Outcome of one proxied request attempt.
///
/// Fields are private so the record stays immutable once produced and the
/// outcome always agrees with the status code:
/// `outcome == Success` exactly when `200 <= status_code < 400`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestResult {
    status_code: u16,
    total_time: f64,
    connect_time: f64,
    outcome: OutcomeKind,
}

impl RequestResult {
    /// Build a result from an observed HTTP response.
    ///
    /// A code that is not a real HTTP status (e.g. curl's `000`) collapses to
    /// a transport error with `status_code = 0` and unmeasured timings.
    pub fn from_response(status_code: u16, total_time: f64, connect_time: f64) -> Self {
        match OutcomeKind::from_status_code(status_code) {
            OutcomeKind::TransportError => Self::transport_error(),
            outcome => Self {
                status_code,
                total_time: sanitize(total_time),
                connect_time: sanitize(connect_time),
                outcome,
            },
        }
    }

    pub fn timeout() -> Self {
        Self::failed(OutcomeKind::Timeout)
    }

    pub fn transport_error() -> Self {
        Self::failed(OutcomeKind::TransportError)
    }

    pub fn protocol_failure() -> Self {
        Self::failed(OutcomeKind::ProtocolFailure)
    }

    /// A failure with no valid response: status 0 and zero timings.
    ///
    /// `Success` is not a failure; it is mapped to `TransportError` so the
    /// status/outcome invariant cannot be broken through this constructor.
    pub fn failed(outcome: OutcomeKind) -> Self {
        let outcome = match outcome {
            OutcomeKind::Success => OutcomeKind::TransportError,
            other => other,
        };
        Self {
            status_code: 0,
            total_time: 0.0,
            connect_time: 0.0,
            outcome,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Total request duration in seconds; 0.0 when unmeasured.
    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    /// Time to establish the proxied connection in seconds; 0.0 when unmeasured.
    pub fn connect_time(&self) -> f64 {
        self.connect_time
    }

    pub fn outcome(&self) -> OutcomeKind {
        self.outcome
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

fn sanitize(seconds: f64) -> f64 {
    if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        0.0
    }
}
