//! [`EventSource`] backed by a node: protocol logs from `eth_getLogs`, block
//! timestamps from `eth_getBlockByNumber`.

use crate::events::{Event, EventArgs, EventKind, EventSource, RawLog};
use crate::rpc::client::{AsyncRpcClient, RpcError};
use crate::rpc::helpers::RpcLog;
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
pub struct RpcEventSource {
    client: AsyncRpcClient,
    protocol: Address,
}

impl RpcEventSource {
    pub fn new(client: AsyncRpcClient, protocol: Address) -> Self {
        Self { client, protocol }
    }

    pub fn client(&self) -> &AsyncRpcClient {
        &self.client
    }

    /// Fetches `[from, to]`, halving any range whose response is too large.
    async fn logs_in(&self, topics: &[B256], from: u64, to: u64) -> Result<Vec<RpcLog>> {
        let mut pending = vec![(from, to)];
        let mut logs = Vec::new();

        while let Some((start, end)) = pending.pop() {
            match self.client.get_logs(self.protocol, topics, start, end).await {
                Ok(mut chunk) => logs.append(&mut chunk),
                Err(err) if start < end && is_oversized(&err) => {
                    let mid = start + (end - start) / 2;
                    tracing::debug!(
                        start_block = start,
                        end_block = end,
                        split_at = mid,
                        "splitting oversized log range"
                    );
                    pending.push((mid + 1, end));
                    pending.push((start, mid));
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to fetch protocol logs for blocks {start}..={end}")
                    })
                }
            }
        }

        Ok(logs)
    }

    async fn timestamps(&self, blocks: Vec<u64>) -> Result<HashMap<u64, u64>> {
        let headers = self
            .client
            .block_headers(&blocks)
            .await
            .context("failed to fetch block timestamps")?;
        Ok(blocks
            .into_iter()
            .zip(headers)
            .map(|(block, header)| (block, header.timestamp))
            .collect())
    }

    async fn fetch(&self, kinds: &[EventKind], from: u64, to: u64) -> Result<Vec<Event>> {
        if kinds.is_empty() || from > to {
            return Ok(Vec::new());
        }

        let topics: Vec<B256> = kinds.iter().map(EventKind::topic).collect();
        let logs = self.logs_in(&topics, from, to).await?;

        let decoded: Vec<(EventArgs, RpcLog)> = logs
            .into_iter()
            .filter(|log| !log.removed && log.address == self.protocol)
            .filter_map(|log| match EventArgs::decode_log(&log.topics, &log.data) {
                Some(args) if kinds.contains(&args.kind()) => Some((args, log)),
                Some(_) => None,
                None => {
                    tracing::debug!(
                        block = log.block_number,
                        log_index = log.log_index,
                        transaction_hash = %log.transaction_hash,
                        "skipping undecodable protocol log"
                    );
                    None
                }
            })
            .collect();

        let blocks: BTreeSet<u64> = decoded.iter().map(|(_, log)| log.block_number).collect();
        let timestamps = self.timestamps(blocks.into_iter().collect()).await?;

        let mut events: Vec<Event> = decoded
            .into_iter()
            .map(|(args, log)| {
                let raw_log = RawLog {
                    block_number: log.block_number,
                    log_index: log.log_index,
                    transaction_hash: log.transaction_hash,
                    timestamp: timestamps.get(&log.block_number).copied().unwrap_or_default(),
                };
                Event::new(args, raw_log)
            })
            .collect();
        events.sort_by_key(|event| (event.raw_log.block_number, event.raw_log.log_index));
        events.dedup_by_key(|event| (event.raw_log.block_number, event.raw_log.log_index));

        tracing::debug!(
            start_block = from,
            end_block = to,
            events = events.len(),
            "fetched protocol events"
        );
        Ok(events)
    }
}

fn is_oversized(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RpcError>(),
        Some(RpcError::ResponseTooLarge { .. })
    )
}

impl EventSource for RpcEventSource {
    fn chain_head(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { self.client.block_number().await })
    }

    fn fetch_events<'a>(
        &'a self,
        kinds: &'a [EventKind],
        from: u64,
        to: u64,
    ) -> BoxFuture<'a, Result<Vec<Event>>> {
        Box::pin(self.fetch(kinds, from, to))
    }
}
