//! Shared retry context, logging helpers, and canned message templates used by
//! the RPC client to keep instrumentation consistent across operations.

use crate::rpc::circuit_breaker::CircuitState;
use anyhow::Error;
use std::time::Duration;

macro_rules! log_with_retry_ctx {
    ($level:ident, $ctx:expr, $($rest:tt)*) => {{
        if let Some(range) = $ctx.range {
            tracing::$level!(
                from_block = range.from,
                to_block = range.to,
                $($rest)*
            );
        } else {
            tracing::$level!($($rest)*);
        }
    }};
}

pub(crate) use log_with_retry_ctx;

#[derive(Clone, Copy)]
struct RetryRange {
    from: u64,
    to: u64,
}

/// Logging labels that describe how a particular RPC operation should report
/// circuit-breaker state, retry attempts, and exhaustion.
#[derive(Clone, Copy)]
pub(crate) struct RetryMessages {
    pub(crate) method: &'static str,
    pub(crate) permit: &'static str,
    pub(crate) circuit_open: &'static str,
    pub(crate) timeout: &'static str,
    pub(crate) retry: &'static str,
    pub(crate) exhausted: &'static str,
    pub(crate) exhausted_timeout: Option<&'static str>,
    pub(crate) oversized: Option<&'static str>,
}

/// Context passed into `retry_with_breaker` so callers can attach an optional
/// block range and reuse consistent log messaging.
#[derive(Clone, Copy)]
pub(crate) struct RetryContext<'a> {
    range: Option<RetryRange>,
    messages: &'a RetryMessages,
}

impl<'a> RetryContext<'a> {
    pub(crate) fn new(messages: &'a RetryMessages) -> Self {
        Self {
            range: None,
            messages,
        }
    }

    pub(crate) fn with_range(messages: &'a RetryMessages, from: u64, to: u64) -> Self {
        Self {
            range: Some(RetryRange { from, to }),
            messages,
        }
    }

    pub(crate) fn with_blocks(messages: &'a RetryMessages, blocks: &[u64]) -> Self {
        let range = blocks.first().map(|from| RetryRange {
            from: *from,
            to: blocks.last().copied().unwrap_or(*from),
        });
        Self { range, messages }
    }

    pub(crate) fn log_permit(&self, state: CircuitState) {
        log_with_retry_ctx!(
            trace,
            self,
            breaker_state = ?state,
            "{}",
            self.messages.permit
        );
    }

    pub(crate) fn method(&self) -> &'static str {
        self.messages.method
    }

    pub(crate) fn log_circuit_open(&self, retry_in: Duration) {
        let retry_in_ms = Self::duration_to_millis(retry_in);
        log_with_retry_ctx!(warn, self, retry_in_ms, "{}", self.messages.circuit_open);
    }

    pub(crate) fn log_timeout(&self, attempt: usize, method: &str, backoff: Duration) {
        let backoff_ms = Self::duration_to_millis(backoff);
        log_with_retry_ctx!(
            warn,
            self,
            attempt,
            method = method,
            backoff_ms = backoff_ms,
            "{}",
            self.messages.timeout
        );
    }

    pub(crate) fn log_retry(&self, attempt: usize, backoff: Duration, err: &Error, timeout: bool) {
        let backoff_ms = Self::duration_to_millis(backoff);
        log_with_retry_ctx!(
            warn,
            self,
            attempt,
            backoff_ms = backoff_ms,
            error = %err,
            timeout = timeout,
            "{}",
            self.messages.retry
        );
    }

    pub(crate) fn log_exhausted(&self, attempt: usize, err: &Error, timeout: bool) {
        let message = if timeout {
            self.messages
                .exhausted_timeout
                .unwrap_or(self.messages.exhausted)
        } else {
            self.messages.exhausted
        };
        log_with_retry_ctx!(error, self, attempt, error = %err, "{}", message);
    }

    pub(crate) fn log_oversized(&self, attempt: usize, method: &str) {
        if let Some(message) = self.messages.oversized {
            log_with_retry_ctx!(warn, self, attempt, method = method, "{}", message);
        }
    }

    fn duration_to_millis(backoff: Duration) -> u64 {
        backoff.as_millis().min(u128::from(u64::MAX)) as u64
    }
}

pub(crate) const BLOCK_NUMBER_RETRY: RetryMessages = RetryMessages {
    method: "eth_blockNumber",
    permit: "circuit breaker permit acquired",
    circuit_open: "RPC circuit breaker open; rejecting eth_blockNumber request",
    timeout: "eth_blockNumber timed out; retrying",
    retry: "eth_blockNumber failed; retrying",
    exhausted: "eth_blockNumber exhausted retries",
    exhausted_timeout: Some("eth_blockNumber exhausted retries after timeout"),
    oversized: None,
};

pub(crate) const GET_LOGS_RETRY: RetryMessages = RetryMessages {
    method: "eth_getLogs",
    permit: "circuit breaker permit acquired for eth_getLogs",
    circuit_open: "RPC circuit breaker open; rejecting eth_getLogs request",
    timeout: "eth_getLogs timed out; will retry",
    retry: "eth_getLogs failed; retrying",
    exhausted: "eth_getLogs exhausted retries",
    exhausted_timeout: None,
    oversized: Some("eth_getLogs response exceeded HTTP size limit; splitting range"),
};

pub(crate) const BLOCK_HEADERS_RETRY: RetryMessages = RetryMessages {
    method: "eth_getBlockByNumber",
    permit: "circuit breaker permit acquired for eth_getBlockByNumber batch",
    circuit_open: "RPC circuit breaker open; rejecting eth_getBlockByNumber batch",
    timeout: "eth_getBlockByNumber batch timed out; will retry",
    retry: "eth_getBlockByNumber batch failed; retrying",
    exhausted: "eth_getBlockByNumber batch exhausted retries",
    exhausted_timeout: None,
    oversized: Some("eth_getBlockByNumber batch exceeded HTTP size limit"),
};
