use std::sync::atomic::{AtomicU64, Ordering};
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
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters describing indexing progress.
#[derive(Default, Debug)]
pub struct Telemetry {
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    processed_blocks: AtomicU64,
    orders_published: AtomicU64,
    orders_classified: AtomicU64,
    executions_recorded: AtomicU64,
    cancellations: AtomicU64,
    simulation_failures: AtomicU64,
}

impl Telemetry {
    pub fn record_cycle_completed(&self, blocks: u64) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.processed_blocks.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn record_cycle_failed(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Applies the counts of a committed cycle.
    pub fn record_cycle_counts(&self, counts: CycleCounts) {
        self.orders_published
            .fetch_add(counts.published, Ordering::Relaxed);
        self.orders_classified
            .fetch_add(counts.classified, Ordering::Relaxed);
        self.executions_recorded
            .fetch_add(counts.executed, Ordering::Relaxed);
        self.cancellations
            .fetch_add(counts.cancelled, Ordering::Relaxed);
        self.simulation_failures
            .fetch_add(counts.simulation_failures, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            processed_blocks: self.processed_blocks.load(Ordering::Relaxed),
            orders_published: self.orders_published.load(Ordering::Relaxed),
            orders_classified: self.orders_classified.load(Ordering::Relaxed),
            executions_recorded: self.executions_recorded.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            simulation_failures: self.simulation_failures.load(Ordering::Relaxed),
        }
    }
}

/// Per-cycle tallies, only folded into [`Telemetry`] once the cycle commits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleCounts {
    pub published: u64,
    pub classified: u64,
    pub executed: u64,
    pub cancelled: u64,
    pub simulation_failures: u64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub processed_blocks: u64,
    pub orders_published: u64,
    pub orders_classified: u64,
    pub executions_recorded: u64,
    pub cancellations: u64,
    pub simulation_failures: u64,
}

/// Spawns a background task that periodically logs indexing throughput and counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
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
                    tracing::info!(target: "tractor_indexer::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let processed_delta = current
                        .processed_blocks
                        .saturating_sub(last_snapshot.processed_blocks);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        processed_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "tractor_indexer::metrics",
                        throughput = format!("{throughput:.2}"),
                        processed = current.processed_blocks,
                        cycles = current.cycles_completed,
                        failed_cycles = current.cycles_failed,
                        published = current.orders_published,
                        classified = current.orders_classified,
                        executions = current.executions_recorded,
                        cancellations = current.cancellations,
                        simulation_failures = current.simulation_failures,
                        "indexer metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
