//! Conversions between Ethereum JSON-RPC wire values (hex quantities, log and
//! header objects) and the plain numbers the indexer works with.

use alloy_primitives::{Address, Bytes, B256};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};

/// Parses a `0x`-prefixed hex quantity.
pub fn parse_quantity(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let Some(digits) = trimmed.strip_prefix("0x") else {
        bail!("quantity {trimmed:?} is missing the 0x prefix");
    };
    if digits.is_empty() {
        bail!("quantity {trimmed:?} has no digits");
    }
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex quantity {trimmed:?}"))
}

pub fn to_quantity(value: u64) -> String {
    format!("{value:#x}")
}

fn quantity<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_quantity(&raw).map_err(serde::de::Error::custom)
}

/// Log object as returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(deserialize_with = "quantity")]
    pub block_number: u64,
    pub transaction_hash: B256,
    #[serde(deserialize_with = "quantity")]
    pub log_index: u64,
    #[serde(default)]
    pub removed: bool,
}

/// The header fields read from `eth_getBlockByNumber`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RpcBlockHeader {
    #[serde(deserialize_with = "quantity")]
    pub number: u64,
    #[serde(deserialize_with = "quantity")]
    pub timestamp: u64,
}
