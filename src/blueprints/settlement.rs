//! Helpers shared by blueprints when an execution settles: valuing the
//! operator tip and summarising the deposits an execution withdrew.

use crate::chain::{ChainState, PriceFeed};
use crate::events::{Event, EventArgs};
use crate::runtime::config::BlueprintSettings;
use alloy_primitives::{Address, I256, U256};
use anyhow::{Context, Result};

/// Scale of prices returned by [`PriceFeed`].
pub const PRICE_PRECISION: U256 = U256::from_limbs([1_000_000, 0, 0, 0]);

/// `amount` of the base asset valued at `price` (6 decimals).
pub fn stable_value(amount: U256, price: U256) -> U256 {
    amount.saturating_mul(price) / PRICE_PRECISION
}

/// Values the operator reward among `inner_events`.
///
/// Only positive rewards paid in the base asset are valued; any other reward
/// (or none at all) yields `None`.
pub async fn resolve_tip(
    prices: &dyn PriceFeed,
    bean: Address,
    inner_events: &[&Event],
) -> Result<Option<U256>> {
    let reward = inner_events.iter().find_map(|event| match &event.args {
        EventArgs::OperatorReward(reward) => Some((reward, event.raw_log.block_number)),
        _ => None,
    });
    let Some((reward, block)) = reward else {
        return Ok(None);
    };
    if reward.token != bean || reward.amount <= I256::ZERO {
        return Ok(None);
    }

    let price = prices
        .price_at(block)
        .await
        .with_context(|| format!("failed to price operator reward at block {block}"))?;
    Ok(Some(stable_value(reward.amount.unsigned_abs(), price)))
}

/// Deposits withdrawn during one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WithdrawnDeposits {
    /// Silo token indices in order of first use.
    pub used_token_indices: Vec<u8>,
    /// BDV-weighted grown stalk per BDV, 10 decimals. `None` when nothing was withdrawn.
    pub used_grown_stalk_per_bdv: Option<U256>,
}

/// Summarises the `RemoveDeposit`/`RemoveDeposits` events among `inner_events`.
pub async fn withdrawn_deposits(
    chain: &dyn ChainState,
    settings: &BlueprintSettings,
    inner_events: &[&Event],
) -> Result<WithdrawnDeposits> {
    let mut used_token_indices = Vec::new();
    let mut total_bdv = U256::ZERO;
    let mut total_grown = U256::ZERO;

    for event in inner_events {
        let removed = match &event.args {
            EventArgs::RemoveDeposit(removed) | EventArgs::RemoveDeposits(removed) => removed,
            _ => continue,
        };

        if let Some(index) = settings.token_index(&removed.token) {
            if !used_token_indices.contains(&index) {
                used_token_indices.push(index);
            }
        }

        let block = event.raw_log.block_number;
        let stem_tip = chain
            .stem_tip_for_token(removed.token, block)
            .await
            .with_context(|| format!("failed to read stem tip for {} at {block}", removed.token))?;

        for (stem, bdv) in removed.stems.iter().zip(&removed.bdvs) {
            let grown = stem_tip.saturating_sub(*stem).max(I256::ZERO).unsigned_abs();
            total_bdv = total_bdv.saturating_add(*bdv);
            total_grown = total_grown.saturating_add(bdv.saturating_mul(grown));
        }
    }

    let used_grown_stalk_per_bdv = (!total_bdv.is_zero()).then(|| total_grown / total_bdv);
    Ok(WithdrawnDeposits {
        used_token_indices,
        used_grown_stalk_per_bdv,
    })
}
