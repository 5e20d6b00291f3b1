use crate::runtime::telemetry;
use alloy_primitives::Address;
use anyhow::{bail, Context, Result};
use std::time::Duration;

pub const DEFAULT_MAX_BLOCKS_PER_CYCLE: u64 = 2000;
pub const DEFAULT_PUBLISH_CONCURRENCY: usize = 50;
pub const DEFAULT_EXECUTE_CONCURRENCY: usize = 50;
pub const DEFAULT_CANCEL_CONCURRENCY: usize = 50;
pub const DEFAULT_SIMULATION_CONCURRENCY: usize = 20;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;
const DEFAULT_IDLE_INTERVAL_SECS: u64 = 30;
const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_BACKOFF_SECS: u64 = 60;

/// Addresses the known blueprints are matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlueprintSettings {
    /// Contract targeted by sow orders through the pipeline.
    pub sow_v0: Address,
    /// Contract targeted by convert-up orders through the pipeline.
    pub convert_up_v0: Address,
    /// The base asset; only operator rewards paid in it are valued.
    pub bean: Address,
    /// Whitelisted silo tokens in index order.
    pub silo_tokens: Vec<Address>,
}

impl BlueprintSettings {
    pub fn token_index(&self, token: &Address) -> Option<u8> {
        self.silo_tokens
            .iter()
            .position(|candidate| candidate == token)
            .and_then(|index| u8::try_from(index).ok())
    }

    pub fn token_at(&self, index: u8) -> Option<Address> {
        self.silo_tokens.get(usize::from(index)).copied()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sow_v0.is_zero() {
            bail!("sow_v0 blueprint address cannot be zero");
        }
        if self.convert_up_v0.is_zero() {
            bail!("convert_up_v0 blueprint address cannot be zero");
        }
        if self.sow_v0 == self.convert_up_v0 {
            bail!("sow_v0 and convert_up_v0 must be distinct contracts");
        }
        if self.bean.is_zero() {
            bail!("bean token address cannot be zero");
        }
        if self.silo_tokens.is_empty() {
            bail!("silo_tokens cannot be empty");
        }
        if self.silo_tokens.len() > usize::from(u8::MAX) {
            bail!("silo_tokens cannot hold more than {} entries", u8::MAX);
        }
        Ok(())
    }
}

/// Runtime configuration for the indexer.
///
/// All instances must be constructed via [`IndexerConfig::builder`] or [`IndexerConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerConfig {
    rpc_url: String,
    protocol_address: Address,
    start_block: Option<u64>,
    confirmation_buffer: u64,
    max_blocks_per_cycle: u64,
    max_return_block: Option<u64>,
    publish_concurrency: usize,
    execute_concurrency: usize,
    cancel_concurrency: usize,
    simulation_concurrency: usize,
    rpc_timeout: Duration,
    idle_interval: Duration,
    metrics_interval: Duration,
    retry_initial_backoff: Duration,
    retry_max_backoff: Duration,
    blueprints: BlueprintSettings,
}

pub struct IndexerConfigParams {
    pub rpc_url: String,
    pub protocol_address: Address,
    pub start_block: Option<u64>,
    pub confirmation_buffer: u64,
    pub max_blocks_per_cycle: u64,
    pub max_return_block: Option<u64>,
    pub publish_concurrency: usize,
    pub execute_concurrency: usize,
    pub cancel_concurrency: usize,
    pub simulation_concurrency: usize,
    pub rpc_timeout: Duration,
    pub idle_interval: Duration,
    pub metrics_interval: Duration,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub blueprints: BlueprintSettings,
}

impl IndexerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> IndexerConfigBuilder {
        IndexerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: IndexerConfigParams) -> Result<Self> {
        let IndexerConfigParams {
            rpc_url,
            protocol_address,
            start_block,
            confirmation_buffer,
            max_blocks_per_cycle,
            max_return_block,
            publish_concurrency,
            execute_concurrency,
            cancel_concurrency,
            simulation_concurrency,
            rpc_timeout,
            idle_interval,
            metrics_interval,
            retry_initial_backoff,
            retry_max_backoff,
            blueprints,
        } = params;

        let config = Self {
            rpc_url: rpc_url.trim().to_owned(),
            protocol_address,
            start_block,
            confirmation_buffer,
            max_blocks_per_cycle,
            max_return_block,
            publish_concurrency,
            execute_concurrency,
            cancel_concurrency,
            simulation_concurrency,
            rpc_timeout,
            idle_interval,
            metrics_interval,
            retry_initial_backoff,
            retry_max_backoff,
            blueprints,
        };

        config.validate()?;
        Ok(config)
    }

    /// Full RPC URL (including scheme) of the execution node.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Protocol diamond emitting the indexed events.
    pub fn protocol_address(&self) -> Address {
        self.protocol_address
    }

    /// Block the watermark is seeded from on first start.
    pub fn start_block(&self) -> Option<u64> {
        self.start_block
    }

    pub fn confirmation_buffer(&self) -> u64 {
        self.confirmation_buffer
    }

    pub fn max_blocks_per_cycle(&self) -> u64 {
        self.max_blocks_per_cycle
    }

    pub fn max_return_block(&self) -> Option<u64> {
        self.max_return_block
    }

    pub fn publish_concurrency(&self) -> usize {
        self.publish_concurrency
    }

    pub fn execute_concurrency(&self) -> usize {
        self.execute_concurrency
    }

    pub fn cancel_concurrency(&self) -> usize {
        self.cancel_concurrency
    }

    /// Publishers simulated in parallel by each blueprint's periodic update.
    pub fn simulation_concurrency(&self) -> usize {
        self.simulation_concurrency
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Sleep between cycles once the indexer has caught up.
    pub fn idle_interval(&self) -> Duration {
        self.idle_interval
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        self.retry_initial_backoff
    }

    pub fn retry_max_backoff(&self) -> Duration {
        self.retry_max_backoff
    }

    pub fn blueprints(&self) -> &BlueprintSettings {
        &self.blueprints
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.rpc_url)?;

        if self.protocol_address.is_zero() {
            bail!("protocol_address cannot be zero");
        }

        if self.max_blocks_per_cycle == 0 {
            bail!("max_blocks_per_cycle must be greater than 0");
        }

        if self.publish_concurrency == 0 {
            bail!("publish_concurrency must be greater than 0");
        }

        if self.execute_concurrency == 0 {
            bail!("execute_concurrency must be greater than 0");
        }

        if self.cancel_concurrency == 0 {
            bail!("cancel_concurrency must be greater than 0");
        }

        if self.simulation_concurrency == 0 {
            bail!("simulation_concurrency must be greater than 0");
        }

        if self.rpc_timeout.is_zero() {
            bail!("rpc_timeout must be greater than 0");
        }

        if self.idle_interval.is_zero() {
            bail!("idle_interval must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.retry_initial_backoff.is_zero() {
            bail!("retry_initial_backoff must be greater than 0");
        }

        if self.retry_max_backoff < self.retry_initial_backoff {
            bail!("retry_max_backoff must be at least retry_initial_backoff");
        }

        if let (Some(start), Some(max_return)) = (self.start_block, self.max_return_block) {
            if max_return < start {
                bail!("max_return_block ({max_return}) cannot precede start_block ({start})");
            }
        }

        self.blueprints.validate()
    }
}

#[derive(Debug, Default, Clone)]
pub struct IndexerConfigBuilder {
    rpc_url: Option<String>,
    protocol_address: Option<Address>,
    start_block: Option<u64>,
    confirmation_buffer: Option<u64>,
    max_blocks_per_cycle: Option<u64>,
    max_return_block: Option<u64>,
    publish_concurrency: Option<usize>,
    execute_concurrency: Option<usize>,
    cancel_concurrency: Option<usize>,
    simulation_concurrency: Option<usize>,
    rpc_timeout: Option<Duration>,
    idle_interval: Option<Duration>,
    metrics_interval: Option<Duration>,
    retry_initial_backoff: Option<Duration>,
    retry_max_backoff: Option<Duration>,
    blueprints: Option<BlueprintSettings>,
}

impl IndexerConfigBuilder {
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn protocol_address(mut self, address: Address) -> Self {
        self.protocol_address = Some(address);
        self
    }

    pub fn start_block(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }

    pub fn confirmation_buffer(mut self, blocks: u64) -> Self {
        self.confirmation_buffer = Some(blocks);
        self
    }

    pub fn max_blocks_per_cycle(mut self, blocks: u64) -> Self {
        self.max_blocks_per_cycle = Some(blocks);
        self
    }

    pub fn max_return_block(mut self, block: u64) -> Self {
        self.max_return_block = Some(block);
        self
    }

    pub fn publish_concurrency(mut self, limit: usize) -> Self {
        self.publish_concurrency = Some(limit);
        self
    }

    pub fn execute_concurrency(mut self, limit: usize) -> Self {
        self.execute_concurrency = Some(limit);
        self
    }

    pub fn cancel_concurrency(mut self, limit: usize) -> Self {
        self.cancel_concurrency = Some(limit);
        self
    }

    pub fn simulation_concurrency(mut self, limit: usize) -> Self {
        self.simulation_concurrency = Some(limit);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = Some(interval);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial_backoff = Some(initial);
        self.retry_max_backoff = Some(max);
        self
    }

    pub fn blueprints(mut self, settings: BlueprintSettings) -> Self {
        self.blueprints = Some(settings);
        self
    }

    pub fn build(self) -> Result<IndexerConfig> {
        let params = IndexerConfigParams {
            rpc_url: self.rpc_url.context("rpc_url is required")?,
            protocol_address: self
                .protocol_address
                .context("protocol_address is required")?,
            start_block: self.start_block,
            confirmation_buffer: self.confirmation_buffer.unwrap_or(0),
            max_blocks_per_cycle: self
                .max_blocks_per_cycle
                .unwrap_or(DEFAULT_MAX_BLOCKS_PER_CYCLE),
            max_return_block: self.max_return_block,
            publish_concurrency: self
                .publish_concurrency
                .unwrap_or(DEFAULT_PUBLISH_CONCURRENCY),
            execute_concurrency: self
                .execute_concurrency
                .unwrap_or(DEFAULT_EXECUTE_CONCURRENCY),
            cancel_concurrency: self.cancel_concurrency.unwrap_or(DEFAULT_CANCEL_CONCURRENCY),
            simulation_concurrency: self
                .simulation_concurrency
                .unwrap_or(DEFAULT_SIMULATION_CONCURRENCY),
            rpc_timeout: self
                .rpc_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS)),
            idle_interval: self
                .idle_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_IDLE_INTERVAL_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            retry_initial_backoff: self
                .retry_initial_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_RETRY_INITIAL_BACKOFF_MS)),
            retry_max_backoff: self
                .retry_max_backoff
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RETRY_MAX_BACKOFF_SECS)),
            blueprints: self.blueprints.context("blueprints is required")?,
        };

        IndexerConfig::new(params)
    }
}

fn validate_url(url: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("rpc_url must start with http:// or https://");
    }
    Ok(())
}
