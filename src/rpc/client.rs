//! RPC client for reading protocol logs and block headers from an Ethereum
//! node via JSON-RPC. Houses the `AsyncRpcClient` and its error type.

use crate::rpc::circuit_breaker::{CallOutcome, RpcCircuitBreaker};
use crate::rpc::helpers::{parse_quantity, to_quantity, RpcBlockHeader, RpcLog};
use crate::rpc::metrics::{RpcMetrics, RpcMetricsSnapshot};
use crate::rpc::options::RpcClientOptions;
use crate::rpc::retry::{
    RetryContext, BLOCK_HEADERS_RETRY, BLOCK_NUMBER_RETRY, GET_LOGS_RETRY,
};
use crate::runtime::config::IndexerConfig;
use alloy_primitives::{Address, B256};
use anyhow::{anyhow, bail, Context, Result};
use jsonrpsee::core::{
    client::{ClientT, Error as JsonRpcError},
    http_helpers::HttpError,
    params::{ArrayParams, BatchRequestBuilder},
};
use jsonrpsee::http_client::transport::Error as HttpTransportError;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use jsonrpsee::types::ErrorObject;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::time::{sleep, timeout, Instant};

#[derive(Debug)]
pub enum RpcError {
    Timeout { method: &'static str },
    CircuitOpen,
    ResponseTooLarge { method: &'static str },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout { method } => write!(f, "rpc method {method} timed out"),
            RpcError::CircuitOpen => write!(f, "rpc circuit breaker is open"),
            RpcError::ResponseTooLarge { method } => {
                write!(f, "rpc {method} response exceeded HTTP size limits")
            }
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Debug, Clone)]
pub struct AsyncRpcClient {
    rpc_url: Arc<String>,
    client: HttpClient,
    options: RpcClientOptions,
    metrics: Arc<RpcMetrics>,
    breaker: Arc<RpcCircuitBreaker>,
}

impl AsyncRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_options(url, RpcClientOptions::default())
    }

    pub fn with_options(url: impl Into<String>, options: RpcClientOptions) -> Result<Self> {
        let breaker = Arc::new(RpcCircuitBreaker::new(options.breaker));
        Self::with_options_and_breaker(url, options, breaker)
    }

    pub fn with_options_and_breaker(
        url: impl Into<String>,
        options: RpcClientOptions,
        breaker: Arc<RpcCircuitBreaker>,
    ) -> Result<Self> {
        options.validate()?;

        let rpc_url = url.into();
        let max_request_body_size = options.max_request_body_bytes.min(u32::MAX as usize) as u32;
        let max_response_body_size = options.max_response_body_bytes.min(u32::MAX as usize) as u32;

        let client = HttpClientBuilder::default()
            .request_timeout(options.request_timeout)
            .max_concurrent_requests(options.max_concurrent_requests)
            .max_request_size(max_request_body_size)
            .max_response_size(max_response_body_size)
            .build(&rpc_url)
            .map_err(|err| anyhow!("failed to build RPC client: {err}"))?;

        Ok(Self {
            rpc_url: Arc::new(rpc_url),
            client,
            options,
            metrics: Arc::new(RpcMetrics::default()),
            breaker,
        })
    }

    pub fn from_config(config: &IndexerConfig) -> Result<Self> {
        config.validate()?;
        let options = RpcClientOptions {
            request_timeout: config.rpc_timeout(),
            ..RpcClientOptions::default()
        };
        Self::with_options(config.rpc_url().to_owned(), options)
    }

    pub fn endpoint(&self) -> &str {
        &self.rpc_url
    }

    pub fn metrics(&self) -> RpcMetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.breaker_state = self.breaker.snapshot().state;
        snapshot
    }

    /// Latest block number known to the node.
    pub async fn block_number(&self) -> Result<u64> {
        const METHOD: &str = "eth_blockNumber";

        self.retry_with_breaker(
            RetryContext::new(&BLOCK_NUMBER_RETRY),
            || async {
                let raw: String = self.request(METHOD, rpc_params![]).await?;
                parse_quantity(&raw).context("eth_blockNumber returned an invalid quantity")
            },
            |attempt, head: &u64| {
                tracing::debug!(attempt, head = *head, "refreshed chain head");
            },
        )
        .await
    }

    /// Logs emitted by `address` in `[from, to]` whose first topic is one of `topics`.
    pub async fn get_logs(
        &self,
        address: Address,
        topics: &[B256],
        from: u64,
        to: u64,
    ) -> Result<Vec<RpcLog>> {
        const METHOD: &str = "eth_getLogs";

        let filter = json!({
            "address": address,
            "fromBlock": to_quantity(from),
            "toBlock": to_quantity(to),
            "topics": [topics],
        });

        self.retry_with_breaker(
            RetryContext::with_range(&GET_LOGS_RETRY, from, to),
            || async { self.request(METHOD, rpc_params![filter.clone()]).await },
            |attempt, logs: &Vec<RpcLog>| {
                tracing::debug!(attempt, count = logs.len(), "eth_getLogs completed successfully");
            },
        )
        .await
    }

    /// Headers of `blocks`, fetched as one batch and returned in request order.
    pub async fn block_headers(&self, blocks: &[u64]) -> Result<Vec<RpcBlockHeader>> {
        if blocks.is_empty() {
            return Ok(Vec::new());
        }

        let headers = self
            .retry_with_breaker(
                RetryContext::with_blocks(&BLOCK_HEADERS_RETRY, blocks),
                || async { self.fetch_headers_once(blocks).await },
                |attempt, headers: &Vec<Option<RpcBlockHeader>>| {
                    tracing::debug!(
                        attempt,
                        count = headers.len(),
                        "eth_getBlockByNumber batch completed successfully"
                    );
                },
            )
            .await?;

        if headers.len() != blocks.len() {
            bail!(
                "RPC returned mismatched header count (expected {}, got {})",
                blocks.len(),
                headers.len()
            );
        }

        blocks
            .iter()
            .zip(headers)
            .map(|(block, header)| {
                header.ok_or_else(|| anyhow!("block {block} is not available on the node"))
            })
            .collect()
    }

    /// Shared retry/backoff loop that wraps RPC operations with breaker gating, metrics,
    /// exponential backoff, and consistent logging.
    async fn retry_with_breaker<T, F, Fut, S>(
        &self,
        context: RetryContext<'_>,
        mut operation: F,
        mut on_success: S,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        S: FnMut(usize, &T),
    {
        let mut attempt = 0;

        loop {
            let admission = match self.breaker.admit(context.method()) {
                Ok(admission) => admission,
                Err(refused) => {
                    context.log_circuit_open(refused.retry_in);
                    return Err(anyhow::Error::new(refused).context(RpcError::CircuitOpen));
                }
            };
            context.log_permit(admission.state());

            attempt += 1;
            let start = Instant::now();
            let result = operation().await;
            let elapsed = start.elapsed();
            let outcome = match &result {
                Ok(_) => CallOutcome::Answered,
                Err(err) => outcome_of(err),
            };
            self.breaker.settle(admission, outcome);

            let err = match result {
                Ok(value) => {
                    self.metrics.record_success(elapsed);
                    on_success(attempt, &value);
                    return Ok(value);
                }
                Err(err) => err,
            };

            match outcome {
                CallOutcome::Oversized => {
                    // The node answered; callers shrink the request.
                    self.metrics.record_oversized(elapsed);
                    context.log_oversized(attempt, context.method());
                    return Err(err);
                }
                CallOutcome::TimedOut => self.metrics.record_timeout(elapsed),
                _ => self.metrics.record_failure(elapsed),
            }

            let timed_out = outcome == CallOutcome::TimedOut;
            if attempt >= self.options.max_attempts {
                context.log_exhausted(attempt, &err, timed_out);
                return Err(err);
            }

            let backoff = self.backoff_delay(attempt);
            if timed_out {
                context.log_timeout(attempt, context.method(), backoff);
            } else {
                context.log_retry(attempt, backoff, &err, false);
            }
            sleep(backoff).await;
        }
    }

    async fn request<R>(&self, method: &'static str, params: ArrayParams) -> Result<R>
    where
        R: DeserializeOwned,
    {
        timeout(self.options.request_timeout, self.client.request(method, params))
            .await
            .map_err(|_| RpcError::Timeout { method })?
            .map_err(|err| map_rpc_error(method, err))
    }

    async fn fetch_headers_once(&self, blocks: &[u64]) -> Result<Vec<Option<RpcBlockHeader>>> {
        let mut batch = BatchRequestBuilder::new();

        for block in blocks {
            batch
                .insert("eth_getBlockByNumber", rpc_params![to_quantity(*block), false])
                .context("failed to serialize eth_getBlockByNumber params")?;
        }

        self.execute_batch(batch, "eth_getBlockByNumber").await
    }

    async fn execute_batch<'a, R>(
        &self,
        batch: BatchRequestBuilder<'a>,
        label: &'static str,
    ) -> Result<Vec<R>>
    where
        R: DeserializeOwned + fmt::Debug + 'static,
    {
        let response = timeout(
            self.options.request_timeout,
            self.client.batch_request(batch),
        )
        .await
        .map_err(|_| RpcError::Timeout { method: label })?
        .map_err(|err| map_rpc_error(label, err))?;

        let mut values = Vec::with_capacity(response.len());
        for entry in response.into_iter() {
            match entry {
                Ok(value) => values.push(value),
                Err(err) => return Err(map_rpc_batch_error(label, &err)),
            }
        }

        tracing::debug!(
            method = label,
            count = values.len(),
            "batch RPC call completed"
        );

        Ok(values)
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return self.options.initial_backoff;
        }

        let exponent = attempt.saturating_sub(1) as u32;
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let mut delay = self.options.initial_backoff.saturating_mul(multiplier);

        if delay > self.options.max_backoff {
            delay = self.options.max_backoff;
        }

        delay
    }
}

fn outcome_of(err: &anyhow::Error) -> CallOutcome {
    match err.downcast_ref::<RpcError>() {
        Some(RpcError::ResponseTooLarge { .. }) => CallOutcome::Oversized,
        Some(RpcError::Timeout { .. }) => CallOutcome::TimedOut,
        _ => CallOutcome::Failed,
    }
}

fn map_rpc_error(label: &'static str, err: JsonRpcError) -> anyhow::Error {
    if response_too_large(&err) {
        return RpcError::ResponseTooLarge { method: label }.into();
    }
    anyhow!("rpc {label} call failed: {err}")
}

fn map_rpc_batch_error(label: &str, err: &ErrorObject<'_>) -> anyhow::Error {
    if let Some(data) = err.data() {
        anyhow!(
            "rpc {label} call failed (code={}, message={}, data={})",
            err.code(),
            err.message(),
            data.get()
        )
    } else {
        anyhow!(
            "rpc {label} call failed (code={}, message={})",
            err.code(),
            err.message()
        )
    }
}

fn response_too_large(err: &JsonRpcError) -> bool {
    match err {
        JsonRpcError::Transport(inner) => {
            if let Some(transport_err) = inner.downcast_ref::<HttpTransportError>() {
                match transport_err {
                    HttpTransportError::Http(http_err) => matches!(http_err, HttpError::TooLarge),
                    HttpTransportError::RequestTooLarge => true,
                    _ => false,
                }
            } else {
                false
            }
        }
        _ => false,
    }
}
