use std::env;
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use proxy_loadtest::client::build_client;
use proxy_loadtest::config::{ConfigError, ExecutionMode, RunConfig};
use proxy_loadtest::driver::RequestDriver;
use proxy_loadtest::fd_sampler::build_sampler;
use proxy_loadtest::fixture::{TargetFixture, DEFAULT_PAYLOAD};
use proxy_loadtest::metrics::{gather_metrics_string, register_metrics, start_metrics_server};
use proxy_loadtest::orchestrator::Orchestrator;
use proxy_loadtest::report::{ReportFormat, RunReport};
use proxy_loadtest::stats::summarize;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Usage: proxy_loadtest [PID]");
    eprintln!();
    eprintln!("Load configuration (environment variables):");
    eprintln!("  CONFIG_FILE             - YAML file with the same settings (env overrides it)");
    eprintln!("  TARGET_URL              - URL fetched through the proxy (default: http://127.0.0.1:9090/)");
    eprintln!("  PROXY_ADDR              - SOCKS5 proxy host:port (default: 127.0.0.1:1080)");
    eprintln!("  CONCURRENCY             - Parallel execution units (default: 500, must be > 0)");
    eprintln!("  REQUESTS_PER_WORKER     - Sequential requests per unit (default: 1, must be > 0)");
    eprintln!("  ROUNDS                  - Enables multi-round mode with this many rounds");
    eprintln!("  ROUND_SETTLE            - Pause before each FD sample (default: 200ms)");
    eprintln!("  ROUND_PAUSE             - Pause between rounds (default: 100ms)");
    eprintln!();
    eprintln!("Client configuration:");
    eprintln!("  CLIENT_BACKEND          - curl or native (default: curl)");
    eprintln!("  CURL_PATH               - curl executable (default: curl)");
    eprintln!("  CONNECT_TIMEOUT         - Connect timeout: 500ms, 5s (default: 5s)");
    eprintln!("  MAX_TIME                - Total request timeout (default: 10s)");
    eprintln!("  HARD_TIMEOUT_GRACE      - Extra time before a hung client is abandoned (default: 5s)");
    eprintln!("  EXPECTED_BODY           - Successful responses must carry exactly this body");
    eprintln!("  LAUNCH_BATCH_SIZE       - Units launched per batch, 0 = all at once (default: 50)");
    eprintln!("  LAUNCH_BATCH_DELAY      - Delay between launch batches (default: 100ms)");
    eprintln!();
    eprintln!("FD monitoring:");
    eprintln!("  MONITOR_PID             - Process to sample (also accepted as first argument)");
    eprintln!("  FD_SAMPLER              - lsof or procfs (default: lsof)");
    eprintln!("  SAMPLER_TIMEOUT         - Bound on a single sample (default: 5s)");
    eprintln!("  FD_LEAK_TOLERANCE       - Allowed growth from first to last sample (default: 10)");
    eprintln!();
    eprintln!("Reporting:");
    eprintln!("  SUCCESS_THRESHOLD       - Minimum success ratio for exit code 0 (default: 0.9)");
    eprintln!("  REPORT_FORMAT           - text or json (default: text)");
    eprintln!("  METRICS_PORT            - Serve Prometheus metrics on this port during the run");
    eprintln!("  METRIC_NAMESPACE        - Prometheus metric namespace (default: proxy_loadtest)");
    eprintln!("  START_FIXTURE           - Start the built-in target server (default: false)");
    eprintln!("  FIXTURE_ADDR            - Target server bind address (default: 127.0.0.1:9090)");
    eprintln!("  RUST_LOG / LOG_FORMAT   - Log filter (default: info) / 'json' for JSON logs");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    // Register Prometheus metrics
    register_metrics()?;

    // Load configuration from CONFIG_FILE, environment variables and the PID argument
    let mut config = match RunConfig::from_env_with_pid_arg(env::args().nth(1)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            print_config_help();
            std::process::exit(1);
        }
    };

    if config.start_fixture && config.expected_body.is_none() {
        config.expected_body = Some(String::from_utf8_lossy(DEFAULT_PAYLOAD).into_owned());
    }

    if config.report_format == ReportFormat::Text {
        config.print_summary();
    }

    let registry_arc = Arc::new(Mutex::new(prometheus::default_registry().clone()));
    if let Some(port) = config.metrics_port {
        let registry = registry_arc.clone();
        tokio::spawn(async move {
            start_metrics_server(port, registry).await;
        });
    }

    let fixture = if config.start_fixture {
        let payload = config
            .expected_body
            .clone()
            .map(|b| b.into_bytes())
            .unwrap_or_else(|| DEFAULT_PAYLOAD.to_vec());
        Some(TargetFixture::start(config.fixture_addr, payload).await?)
    } else {
        None
    };

    // Build the HTTP client and make sure it can actually run
    let client = match build_client(&config.to_client_config()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", ConfigError::ClientUnavailable(e.to_string()));
            std::process::exit(1);
        }
    };
    if let Err(e) = client.preflight().await {
        eprintln!("Configuration error: {}", ConfigError::ClientUnavailable(e.to_string()));
        std::process::exit(1);
    }
    info!(client = client.name(), "HTTP client ready");

    let driver = RequestDriver::new(client, config.hard_timeout_grace)
        .with_expected_body(config.expected_body.clone().map(String::into_bytes));

    let mode = config.mode();
    let mut orchestrator = Orchestrator::new(Arc::new(driver), config.request_spec(), config.concurrency)
        .with_launch(config.launch);
    if let Some(pid) = config.monitor_pid {
        if matches!(mode, ExecutionMode::SingleWave { .. }) {
            warn!(pid = pid, "MONITOR_PID is set but ROUNDS is not; FD samples are only taken in multi-round mode");
        }
        orchestrator = orchestrator.with_fd_monitor(build_sampler(config.sampler, config.sampler_timeout), pid);
    }

    let outcome = orchestrator.run(&mode).await;
    info!(
        results = outcome.results.len(),
        elapsed_secs = outcome.elapsed.as_secs_f64(),
        "Load generation finished"
    );

    if let Some(fixture) = fixture {
        fixture.stop().await;
    }

    let report = RunReport::new(
        summarize(&outcome.results),
        outcome.elapsed,
        outcome.fd_samples,
        config.success_threshold,
        config.fd_leak_tolerance,
    );

    if let Some(latency) = &report.summary.latency {
        info!(latency = %latency.format(), "Latency summary");
    }

    if let Some(trend) = &report.fd_trend {
        if trend.leak_suspected {
            warn!(
                first = trend.first,
                last = trend.last,
                delta = trend.delta,
                tolerance = config.fd_leak_tolerance,
                "Open FD count grew across rounds; possible descriptor leak in the proxy"
            );
        }
    }

    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!("\n--- FINAL METRICS ---\n{}", gather_metrics_string(&registry_arc));
    }

    match config.report_format {
        ReportFormat::Text => print!("{}", report.render_text()),
        ReportFormat::Json => match report.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!(error = %e, "Failed to serialize report");
                print!("{}", report.render_text());
            }
        },
    }

    std::process::exit(report.exit_code());
}
