use std::time::{Duration, Instant};

use alloy_primitives::{Address, Bytes, B256, I256, U256};
use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use tractor_indexer::blueprints::envelope::{self, OperatorParams};
use tractor_indexer::blueprints::sow_v0::{SowParams, SowV0Call};
use tractor_indexer::events::{OperatorReward, Requisition, Sown, TractorExecuted};
use tractor_indexer::{BlueprintSettings, Event, EventArgs, IndexerConfig, RawLog};

pub const PROTOCOL: Address = Address::repeat_byte(0x9f);
pub const SOW_TARGET: Address = Address::repeat_byte(0xa1);
pub const CONVERT_TARGET: Address = Address::repeat_byte(0xa2);
pub const BEAN: Address = Address::repeat_byte(0xb0);
pub const LP_TOKEN: Address = Address::repeat_byte(0xb1);
pub const PUBLISHER: Address = Address::repeat_byte(0x11);
pub const OPERATOR: Address = Address::repeat_byte(0x22);

const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub fn settings() -> BlueprintSettings {
    BlueprintSettings {
        sow_v0: SOW_TARGET,
        convert_up_v0: CONVERT_TARGET,
        bean: BEAN,
        silo_tokens: vec![BEAN, LP_TOKEN],
    }
}

/// Config pointing at `rpc_url` with fast retries and a short idle interval.
pub fn config(rpc_url: &str, start_block: u64, max_blocks: u64) -> Result<IndexerConfig> {
    IndexerConfig::builder()
        .rpc_url(rpc_url)
        .protocol_address(PROTOCOL)
        .start_block(start_block)
        .max_blocks_per_cycle(max_blocks)
        .idle_interval(Duration::from_millis(20))
        .metrics_interval(Duration::from_millis(50))
        .retry_backoff(Duration::from_millis(5), Duration::from_millis(20))
        .blueprints(settings())
        .build()
}

pub fn timestamp_of(block: u64) -> u64 {
    GENESIS_TIMESTAMP + block * 12
}

pub fn hash(byte: u8) -> B256 {
    B256::repeat_byte(byte)
}

pub fn raw(block: u64, log_index: u64, tx: B256) -> RawLog {
    RawLog {
        block_number: block,
        log_index,
        transaction_hash: tx,
        timestamp: timestamp_of(block),
    }
}

/// A sow order wrapped the way the protocol publishes it.
pub fn sow_payload(total: u64, max_per_season: u64, tip: i64) -> Bytes {
    let call = SowV0Call {
        sow: SowParams {
            source_token_indices: vec![0],
            total_amount_to_sow: U256::from(total),
            min_amount_to_sow_per_season: U256::from(1u8),
            max_amount_to_sow_per_season: U256::from(max_per_season),
            min_temp: U256::from(1_000_000u64),
            max_podline_length: U256::from(1_000_000_000_000u64),
            max_grown_stalk_per_bdv: U256::MAX,
            run_blocks_after_sunrise: U256::ZERO,
            slippage_ratio: U256::from(1_000_000_000_000_000_000u128),
        },
        operator: OperatorParams {
            whitelisted_operators: Vec::new(),
            tip_address: OPERATOR,
            operator_tip_amount: I256::try_from(tip).unwrap(),
        },
    };
    envelope::wrap(SOW_TARGET, call.encode()).into()
}

pub fn publish(block: u64, log_index: u64, blueprint_hash: B256, data: Bytes) -> Event {
    Event::new(
        EventArgs::PublishRequisition(Requisition {
            publisher: PUBLISHER,
            data,
            operator_paste_instrs: Vec::new(),
            max_nonce: U256::from(100u8),
            start_time: U256::from(timestamp_of(0)),
            end_time: U256::MAX,
            blueprint_hash,
            signature: Bytes::from_static(&[0x5a; 65]),
        }),
        raw(block, log_index, hash(block as u8)),
    )
}

pub fn tractor(block: u64, log_index: u64, tx: B256, blueprint_hash: B256, nonce: u64) -> Event {
    Event::new(
        EventArgs::Tractor(TractorExecuted {
            operator: OPERATOR,
            publisher: PUBLISHER,
            blueprint_hash,
            nonce: U256::from(nonce),
            gas_remaining: U256::from(250_000u64),
        }),
        raw(block, log_index, tx),
    )
}

pub fn sow(block: u64, log_index: u64, tx: B256, beans: u64, index: u64) -> Event {
    Event::new(
        EventArgs::Sow(Sown {
            account: PUBLISHER,
            field_id: U256::ZERO,
            index: U256::from(index),
            beans: U256::from(beans),
            pods: U256::from(beans * 2),
        }),
        raw(block, log_index, tx),
    )
}

pub fn reward(block: u64, log_index: u64, tx: B256, amount: i64) -> Event {
    Event::new(
        EventArgs::OperatorReward(OperatorReward {
            reward_type: 0,
            publisher: PUBLISHER,
            operator: OPERATOR,
            token: BEAN,
            amount: I256::try_from(amount).unwrap(),
        }),
        raw(block, log_index, tx),
    )
}

pub fn cancel(block: u64, log_index: u64, blueprint_hash: B256) -> Event {
    Event::new(
        EventArgs::CancelBlueprint { blueprint_hash },
        raw(block, log_index, hash(0xc0 ^ block as u8)),
    )
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, what: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}
