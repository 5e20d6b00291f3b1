//! Cancellable exponential backoff used to retry failed cycles.

use anyhow::Result;
use std::fmt;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Returned when a backoff sleep is interrupted by its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("retry cancelled")
    }
}

impl std::error::Error for Cancelled {}

#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff<'a> {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<usize>,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryBackoff<'a> {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
            cancellation: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub(crate) fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Runs `operation` until it succeeds, sleeping between failures with a doubling delay.
///
/// `on_retry` sees every failure together with the delay that follows it and
/// whether another attempt will be made. Cancellation surfaces as [`Cancelled`].
pub(crate) async fn retry_with_backoff<'a, T, F, Fut, L>(
    config: RetryBackoff<'a>,
    mut operation: F,
    mut on_retry: L,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &anyhow::Error, bool),
{
    let mut attempt = 0;
    let mut backoff = config.initial_delay;

    loop {
        attempt += 1;

        if config.cancellation.is_some_and(CancellationToken::is_cancelled) {
            return Err(Cancelled.into());
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let exhausted = config
                    .max_attempts
                    .map(|max| attempt >= max)
                    .unwrap_or(false);

                on_retry(attempt, backoff, &err, !exhausted);

                if exhausted {
                    return Err(err);
                }

                sleep_with_cancellation(backoff, config.cancellation).await?;
                backoff = next_backoff(backoff, config.max_delay);
            }
        }
    }
}

/// Sleeps for `delay` unless `cancellation` fires first.
pub(crate) async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => Err(Cancelled.into()),
            _ = sleep(delay) => Ok(()),
        }
    } else {
        sleep(delay).await;
        Ok(())
    }
}

pub(crate) fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    let mut next = current.saturating_mul(2);
    if next > max_backoff {
        next = max_backoff;
    }
    next
}
