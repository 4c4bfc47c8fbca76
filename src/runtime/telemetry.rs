use crate::queue::HeightQueue;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    enqueued_heights: AtomicU64,
    indexed_heights: AtomicU64,
    skipped_heights: AtomicU64,
    failed_attempts: AtomicU64,
    requeued_heights: AtomicU64,
    dropped_heights: AtomicU64,
    module_errors: AtomicU64,
    rpc_errors: AtomicU64,
    rpc_timeouts: AtomicU64,
    worker_pool_size: AtomicUsize,
}

impl Telemetry {
    pub fn record_enqueued(&self) {
        self.enqueued_heights.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_indexed(&self) {
        self.indexed_heights.fetch_add(1, Ordering::Relaxed);
    }

    /// Height popped but already stored, so no work was done.
    pub fn record_skipped(&self) {
        self.skipped_heights.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self) {
        self.requeued_heights.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_heights.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_module_error(&self) {
        self.module_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc_error(&self) {
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc_timeout(&self) {
        self.rpc_timeouts.fetch_add(1, Ordering::Relaxed);
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_pool_size(&self, workers: usize) {
        self.worker_pool_size.store(workers, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            enqueued_heights: self.enqueued_heights.load(Ordering::Relaxed),
            indexed_heights: self.indexed_heights.load(Ordering::Relaxed),
            skipped_heights: self.skipped_heights.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            requeued_heights: self.requeued_heights.load(Ordering::Relaxed),
            dropped_heights: self.dropped_heights.load(Ordering::Relaxed),
            module_errors: self.module_errors.load(Ordering::Relaxed),
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
            rpc_timeouts: self.rpc_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn indexed_heights(&self) -> u64 {
        self.indexed_heights.load(Ordering::Relaxed)
    }

    pub fn requeued_heights(&self) -> u64 {
        self.requeued_heights.load(Ordering::Relaxed)
    }

    pub fn module_errors(&self) -> u64 {
        self.module_errors.load(Ordering::Relaxed)
    }

    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub enqueued_heights: u64,
    pub indexed_heights: u64,
    pub skipped_heights: u64,
    pub failed_attempts: u64,
    pub requeued_heights: u64,
    pub dropped_heights: u64,
    pub module_errors: u64,
    pub rpc_errors: u64,
    pub rpc_timeouts: u64,
}

/// Spawns a background task that periodically logs throughput, queue depth, and error counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    queue: Arc<HeightQueue>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "protoindex::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let indexed_delta = current
                        .indexed_heights
                        .saturating_sub(last_snapshot.indexed_heights);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        indexed_delta as f64 / elapsed
                    };
                    let queue_len = queue.len().await;

                    tracing::info!(
                        target: "protoindex::metrics",
                        throughput = format!("{throughput:.2}"),
                        indexed = current.indexed_heights,
                        skipped = current.skipped_heights,
                        queue_len,
                        outstanding = queue.outstanding(),
                        failed_attempts = current.failed_attempts,
                        requeued = current.requeued_heights,
                        dropped = current.dropped_heights,
                        module_errors = current.module_errors,
                        rpc_errors = current.rpc_errors,
                        workers = telemetry.worker_pool_size(),
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
