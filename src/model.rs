//! Rows persisted for every Tractor order and execution, independent of the
//! blueprint that may later claim them.

use crate::store::{Record, Table};
use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const ORDERS: Table<Order> = Table::new("tractor_order");
pub const EXECUTIONS: Table<Execution> = Table::new("tractor_execution");
pub const META: Table<TractorMeta> = Table::new("tractor_meta");

/// Closed set of blueprint types the registry knows how to classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    SowV0,
    ConvertUpV0,
}

impl OrderType {
    pub const ALL: [OrderType; 2] = [OrderType::SowV0, OrderType::ConvertUpV0];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::SowV0 => "SOW_V0",
            OrderType::ConvertUpV0 => "CONVERT_UP_V0",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        OrderType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == value)
            .ok_or_else(|| anyhow::anyhow!("unknown order type {value}"))
    }
}

/// Generic reflection of a published blueprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub blueprint_hash: B256,
    pub order_type: Option<OrderType>,
    pub publisher: Address,
    pub data: Bytes,
    pub operator_paste_instrs: Vec<B256>,
    pub max_nonce: U256,
    pub start_time: u64,
    pub end_time: u64,
    pub signature: Bytes,
    pub published_block: u64,
    pub published_timestamp: u64,
    /// Tip offered to operators, in the base asset. Unknown until a blueprint claims the order.
    pub tip_amount: Option<U256>,
    pub cancelled: bool,
}

impl Order {
    /// Folds a freshly observed publication into a previously stored row.
    ///
    /// Classification, tip and cancellation only ever move forward, so a replayed
    /// publication never downgrades what later processing established.
    pub fn merge_existing(mut self, existing: Option<&Order>) -> Self {
        if let Some(existing) = existing {
            self.order_type = existing.order_type.or(self.order_type);
            self.tip_amount = existing.tip_amount.or(self.tip_amount);
            self.cancelled |= existing.cancelled;
        }
        self
    }

    pub fn is_valid_at(&self, timestamp: u64) -> bool {
        self.start_time <= timestamp && timestamp <= self.end_time
    }
}

impl Record for Order {
    fn key(&self) -> String {
        self.blueprint_hash.to_string()
    }
}

/// One on-chain fulfilment of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub blueprint_hash: B256,
    pub nonce: U256,
    pub operator: Address,
    pub executed_block: u64,
    pub executed_timestamp: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub gas_remaining: U256,
    /// Tip paid, expressed in the stable unit with six decimals.
    pub tip_paid: Option<U256>,
}

impl Execution {
    pub fn key_for(blueprint_hash: &B256, nonce: &U256) -> String {
        format!("{blueprint_hash}:{nonce}")
    }
}

impl Record for Execution {
    fn key(&self) -> String {
        Self::key_for(&self.blueprint_hash, &self.nonce)
    }
}

pub const TRACTOR_META_KEY: &str = "tractor";

/// Persisted catch-up progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TractorMeta {
    pub last_update: Option<u64>,
}

impl Record for TractorMeta {
    fn key(&self) -> String {
        TRACTOR_META_KEY.to_owned()
    }
}
