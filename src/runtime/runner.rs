use crate::processor::backoff::{
    retry_with_backoff, sleep_with_cancellation, Cancelled, RetryBackoff,
};
use crate::processor::orchestrator::Orchestrator;
use crate::runtime::config::IndexerConfig;
use crate::runtime::telemetry::spawn_metrics_reporter;
use anyhow::Result;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Drives catch-up cycles until shutdown and handles OS signals for graceful exits.
pub struct Runner {
    orchestrator: Orchestrator,
    start_block: Option<u64>,
    idle_interval: Duration,
    metrics_interval: Duration,
    retry_initial_backoff: Duration,
    retry_max_backoff: Duration,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(config: &IndexerConfig, orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            start_block: config.start_block(),
            idle_interval: config.idle_interval(),
            metrics_interval: config.metrics_interval(),
            retry_initial_backoff: config.retry_initial_backoff(),
            retry_max_backoff: config.retry_max_backoff(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Runs cycles until the shutdown token is cancelled.
    ///
    /// A cycle that reports more work is followed immediately by the next one;
    /// once caught up the runner idles. Failed cycles are retried with
    /// exponential backoff. An in-flight cycle is never interrupted.
    pub async fn run(&self) -> Result<()> {
        if let Some(start_block) = self.start_block {
            self.orchestrator.initialize(start_block).await?;
        }

        let reporter_shutdown = self.shutdown.child_token();
        let reporter = spawn_metrics_reporter(
            self.orchestrator.telemetry(),
            reporter_shutdown.clone(),
            self.metrics_interval,
        );

        let result = self.cycle_loop().await;

        reporter_shutdown.cancel();
        if let Err(err) = reporter.await {
            tracing::warn!(error = %err, "metrics reporter task failed");
        }
        result
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&self) -> Result<()> {
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        let run = self.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
                self.shutdown.cancel();
            }
        }

        run.await
    }

    async fn cycle_loop(&self) -> Result<()> {
        while !self.shutdown.is_cancelled() {
            let backoff = RetryBackoff::new(self.retry_initial_backoff, self.retry_max_backoff)
                .with_cancellation(&self.shutdown);

            let more_work = retry_with_backoff(
                backoff,
                |_| self.orchestrator.run_cycle(),
                |attempt, delay, err, _| {
                    tracing::warn!(
                        attempt,
                        backoff_ms = delay.as_millis().min(u128::from(u64::MAX)) as u64,
                        error = %err,
                        "indexing cycle failed; backing off"
                    );
                },
            )
            .await;

            let more_work = match more_work {
                Ok(more_work) => more_work,
                Err(err) if err.is::<Cancelled>() => break,
                Err(err) => return Err(err),
            };

            if more_work {
                continue;
            }

            tracing::debug!(
                idle_ms = self.idle_interval.as_millis().min(u128::from(u64::MAX)) as u64,
                "caught up with the chain; idling"
            );
            if sleep_with_cancellation(self.idle_interval, Some(&self.shutdown))
                .await
                .is_err()
            {
                break;
            }
        }

        tracing::info!("runner stopped");
        Ok(())
    }
}
