use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::env;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::result::RequestResult;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "proxy_loadtest".to_string());

    // === Request Metrics ===

    pub static ref REQUEST_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_total", "Total number of proxied requests completed")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_OUTCOMES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("request_outcomes_total", "Number of proxied requests by outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["outcome"]  // success, protocol_failure, timeout, transport_error
        ).unwrap();

    pub static ref REQUEST_STATUS_CODES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_status_codes_total", "Number of proxied requests by status code")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["status_code"]
        ).unwrap();

    pub static ref REQUESTS_IN_FLIGHT: Gauge =
        Gauge::with_opts(
            Opts::new("requests_in_flight", "Number of proxied requests currently in flight")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "Proxied request latencies in seconds, as reported by the client."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Round Metrics ===

    pub static ref ROUNDS_COMPLETED: IntCounter =
        IntCounter::with_opts(
            Opts::new("rounds_completed_total", "Number of load rounds completed")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref MONITORED_OPEN_FDS: IntGauge =
        IntGauge::with_opts(
            Opts::new("monitored_open_fds", "Open file descriptors of the monitored process at the last sample (-1 if unavailable)")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    register_metrics_with(prometheus::default_registry())
}

/// Registers all metrics with `registry`.
pub fn register_metrics_with(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(REQUEST_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_OUTCOMES.clone()))?;
    registry.register(Box::new(REQUEST_STATUS_CODES.clone()))?;
    registry.register(Box::new(REQUESTS_IN_FLIGHT.clone()))?;
    registry.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    registry.register(Box::new(ROUNDS_COMPLETED.clone()))?;
    registry.register(Box::new(MONITORED_OPEN_FDS.clone()))?;
    Ok(())
}

/// Records one completed request.
pub fn record_result(result: &RequestResult) {
    REQUEST_TOTAL.inc();
    REQUEST_OUTCOMES
        .with_label_values(&[result.outcome().label()])
        .inc();
    REQUEST_STATUS_CODES
        .with_label_values(&[status_code_label(result.status_code())])
        .inc();
    if result.total_time() > 0.0 {
        REQUEST_DURATION_SECONDS.observe(result.total_time());
    }
}

/// Returns a static string label for common status codes.
///
/// Uncommon codes fall back to "other" rather than allocating a unique string.
fn status_code_label(code: u16) -> &'static str {
    match code {
        0 => "0",
        200 => "200",
        201 => "201",
        204 => "204",
        301 => "301",
        302 => "302",
        304 => "304",
        400 => "400",
        403 => "403",
        404 => "404",
        405 => "405",
        407 => "407",
        408 => "408",
        429 => "429",
        500 => "500",
        502 => "502",
        503 => "503",
        504 => "504",
        _ => "other",
    }
}

fn encode(registry: &Arc<Mutex<Registry>>) -> Result<(Vec<u8>, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = match registry.lock() {
        Ok(guard) => guard.gather(),
        Err(poisoned) => poisoned.into_inner().gather(),
    };
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let response = match encode(&registry) {
        Ok((buffer, content_type)) => {
            let mut response = Response::new(Body::from(buffer));
            if let Ok(value) = content_type.parse() {
                response
                    .headers_mut()
                    .insert(hyper::header::CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            let mut response = Response::new(Body::from("failed to encode metrics"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    };

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(port = port, error = %e, "Failed to bind metrics server");
            return;
        }
    };
    info!(
        port = port,
        addr = %addr,
        "Metrics server listening"
    );

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

/// Gathers and encodes metrics as a string for final output.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    match encode(registry) {
        Ok((buffer, _)) => String::from_utf8(buffer).unwrap_or_else(|e| {
            warn!(error = %e, "Metrics output is not valid UTF-8");
            String::from("# ERROR ENCODING METRICS TO UTF-8")
        }),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            String::from("# ERROR ENCODING METRICS")
        }
    }
}
