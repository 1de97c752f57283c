//! Fans requests out over a bounded pool of execution units, in one wave or
//! in sequential rounds with an FD sample after each.
//!
//! Each unit owns its output slot (the `Vec` returned through its join
//! handle), so there is no shared result list. A unit that dies is replaced
//! by transport-error results, keeping the total at `units x requests`.
//! Units issue their requests sequentially, so at most `concurrency`
//! requests are ever in flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::client::RequestSpec;
use crate::config::{ExecutionMode, LaunchPolicy};
use crate::driver::RequestDriver;
use crate::fd_sampler::{open_files_soft_limit, FdSample, FdSampler};
use crate::metrics::{record_result, MONITORED_OPEN_FDS, REQUESTS_IN_FLIGHT, ROUNDS_COMPLETED};
use crate::result::RequestResult;

/// Everything a run produced, handed to the aggregator.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub results: Vec<RequestResult>,
    /// One per round in multi-round mode; empty otherwise.
    pub fd_samples: Vec<FdSample>,
    pub elapsed: Duration,
}

/// One slot of the in-flight gauge, released on drop so a unit that
/// unwinds mid-request does not leave the gauge inflated.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        REQUESTS_IN_FLIGHT.inc();
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        REQUESTS_IN_FLIGHT.dec();
    }
}

struct FdMonitor {
    sampler: Arc<dyn FdSampler>,
    pid: u32,
}

/// Drives waves of requests through a shared [`RequestDriver`].
pub struct Orchestrator {
    driver: Arc<RequestDriver>,
    spec: Arc<RequestSpec>,
    concurrency: usize,
    launch: LaunchPolicy,
    monitor: Option<FdMonitor>,
}

impl Orchestrator {
    pub fn new(driver: Arc<RequestDriver>, spec: RequestSpec, concurrency: usize) -> Self {
        Self {
            driver,
            spec: Arc::new(spec),
            concurrency: concurrency.max(1),
            launch: LaunchPolicy::default(),
            monitor: None,
        }
    }

    pub fn with_launch(mut self, launch: LaunchPolicy) -> Self {
        self.launch = launch;
        self
    }

    /// Sample `pid` after every round in multi-round mode.
    pub fn with_fd_monitor(mut self, sampler: Arc<dyn FdSampler>, pid: u32) -> Self {
        self.monitor = Some(FdMonitor { sampler, pid });
        self
    }

    /// Runs to completion. Never fails: every request ends up as a result.
    pub async fn run(&self, mode: &ExecutionMode) -> RunOutcome {
        let start = Instant::now();
        let mut results = Vec::with_capacity(mode.total_requests(self.concurrency).unwrap_or(0));
        let mut fd_samples = Vec::new();

        match *mode {
            ExecutionMode::SingleWave {
                requests_per_worker,
            } => {
                info!(
                    units = self.concurrency,
                    requests_per_unit = requests_per_worker,
                    total = self.concurrency.saturating_mul(requests_per_worker),
                    client = self.driver.client_name(),
                    "Launching single wave"
                );
                results.extend(self.run_wave(1, requests_per_worker).await);
            }
            ExecutionMode::MultiRound {
                rounds,
                settle,
                pause,
            } => {
                info!(
                    rounds = rounds,
                    units = self.concurrency,
                    total = self.concurrency.saturating_mul(rounds),
                    client = self.driver.client_name(),
                    "Launching multi-round run"
                );
                for round in 1..=rounds {
                    let wave = self.run_wave(round, 1).await;
                    let succeeded = wave.iter().filter(|r| r.is_success()).count();
                    results.extend(wave);
                    ROUNDS_COMPLETED.inc();

                    time::sleep(settle).await;

                    let open_fds = self.sample_fds(round).await;
                    info!(
                        round = round,
                        rounds = rounds,
                        succeeded = succeeded,
                        requests = self.concurrency,
                        open_fds = ?open_fds,
                        "Round complete"
                    );

                    if round < rounds {
                        time::sleep(pause).await;
                    }
                    if let Some(fds) = open_fds {
                        fd_samples.push(FdSample {
                            round,
                            open_fds: fds,
                        });
                    }
                }
            }
        }

        RunOutcome {
            results,
            fd_samples,
            elapsed: start.elapsed(),
        }
    }

    async fn sample_fds(&self, round: usize) -> Option<i64> {
        let monitor = self.monitor.as_ref()?;

        if round == 1 {
            match open_files_soft_limit() {
                Some(limit) => info!(soft_limit = limit, "Harness open-file limit"),
                None => debug!("Harness open-file limit unknown"),
            }
        }

        let fds = monitor.sampler.sample(monitor.pid).await;
        MONITORED_OPEN_FDS.set(fds);
        if fds < 0 {
            warn!(
                round = round,
                pid = monitor.pid,
                sampler = monitor.sampler.name(),
                "FD sample unavailable"
            );
        }
        Some(fds)
    }

    /// Launches `concurrency` units, each issuing `per_unit` sequential
    /// requests, and waits for all of them.
    async fn run_wave(&self, wave: usize, per_unit: usize) -> Vec<RequestResult> {
        let completed = Arc::new(AtomicUsize::new(0));
        let progress_step = (self.concurrency / 10).max(1);
        let mut handles = Vec::with_capacity(self.concurrency);

        for unit_id in 0..self.concurrency {
            if let Some(delay) = self.launch.delay_before(unit_id) {
                debug!(wave = wave, launched = unit_id, "Pausing between launch batches");
                time::sleep(delay).await;
            }

            let driver = self.driver.clone();
            let spec = self.spec.clone();
            let completed = completed.clone();
            let units = self.concurrency;

            handles.push(tokio::spawn(async move {
                let mut slot = Vec::with_capacity(per_unit);
                for _ in 0..per_unit {
                    let in_flight = InFlight::enter();
                    let result = driver.execute(&spec).await;
                    drop(in_flight);
                    record_result(&result);
                    slot.push(result);
                }

                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if done % progress_step == 0 || done == units {
                    info!(wave = wave, completed = done, units = units, "Progress");
                }
                slot
            }));
        }

        let mut results = Vec::with_capacity(self.concurrency.checked_mul(per_unit).unwrap_or(0));
        for (unit_id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(slot) => {
                    let missing = per_unit.saturating_sub(slot.len());
                    results.extend(slot);
                    results.extend(std::iter::repeat(RequestResult::transport_error()).take(missing));
                }
                Err(e) => {
                    error!(
                        wave = wave,
                        unit_id = unit_id,
                        error = %e,
                        "Execution unit failed, recording its requests as transport errors"
                    );
                    results.extend(std::iter::repeat(RequestResult::transport_error()).take(per_unit));
                }
            }
        }
        results
    }
}
