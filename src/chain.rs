//! Block-pinned protocol state reads and simulations consumed by blueprints.
//!
//! Implementations are expected to apply their own timeouts and retries; every
//! call here is treated as a single attempt by the indexer.

use alloy_primitives::{Address, I256, U256};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure modes of a simulation that carry information rather than signal a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationError {
    /// The publisher has nothing left that the plan may withdraw.
    NoCollateral,
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationError::NoCollateral => write!(f, "no collateral available"),
        }
    }
}

impl std::error::Error for SimulationError {}

impl SimulationError {
    /// Returns true when `err` (or anything it wraps) is [`SimulationError::NoCollateral`].
    pub fn is_no_collateral(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<SimulationError>(),
                Some(SimulationError::NoCollateral)
            )
        })
    }
}

/// Field conditions at one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldSnapshot {
    /// Temperature, 6 decimals.
    pub temperature: U256,
    pub podline_length: U256,
    pub soil: U256,
}

/// Convert conditions at one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertSnapshot {
    /// Bean price, 6 decimals.
    pub price: U256,
    pub bonus_stalk_per_bdv: U256,
    pub max_seasonal_capacity: U256,
}

/// How deposits with little grown stalk are treated by the withdrawal planner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LowStalkMode {
    #[default]
    Use,
    Omit,
    UseLast,
}

impl LowStalkMode {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(LowStalkMode::Use),
            1 => Some(LowStalkMode::Omit),
            2 => Some(LowStalkMode::UseLast),
            _ => None,
        }
    }

    pub fn index(&self) -> u8 {
        match self {
            LowStalkMode::Use => 0,
            LowStalkMode::Omit => 1,
            LowStalkMode::UseLast => 2,
        }
    }
}

/// Deposit selection rules passed to the withdrawal planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanFilter {
    pub max_grown_stalk_per_bdv: U256,
    pub min_stem: I256,
    pub max_stem: I256,
    pub exclude_germinating: bool,
    pub exclude_bean: bool,
    pub low_stalk_deposits: LowStalkMode,
    pub low_grown_stalk_per_bdv: U256,
    pub seed_difference: I256,
}

impl PlanFilter {
    /// Stem bounds spanning every int96 value.
    pub fn unbounded(max_grown_stalk_per_bdv: U256) -> Self {
        let bound: I256 = I256::ONE << 95usize;
        Self {
            max_grown_stalk_per_bdv,
            min_stem: -bound,
            max_stem: bound - I256::ONE,
            exclude_germinating: true,
            exclude_bean: false,
            low_stalk_deposits: LowStalkMode::Use,
            low_grown_stalk_per_bdv: U256::ZERO,
            seed_difference: I256::ZERO,
        }
    }
}

/// Request for a withdrawal plan funding `amount` beans from `publisher`'s deposits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub publisher: Address,
    pub source_token_indices: Vec<u8>,
    pub amount: U256,
    pub filter: PlanFilter,
}

/// Deposits reserved by a simulated execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WithdrawalPlan {
    pub source_tokens: Vec<Address>,
    pub stems: Vec<Vec<I256>>,
    pub amounts: Vec<Vec<U256>>,
    pub available_beans: Vec<U256>,
    pub total_available_beans: U256,
}

impl WithdrawalPlan {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.source_tokens.is_empty()
    }
}

/// Read access to protocol state pinned at a block.
pub trait ChainState: Send + Sync {
    fn season(&self, block: u64) -> BoxFuture<'_, Result<u32>>;

    fn field_snapshot(&self, block: u64) -> BoxFuture<'_, Result<FieldSnapshot>>;

    fn convert_snapshot(&self, block: u64) -> BoxFuture<'_, Result<ConvertSnapshot>>;

    /// Simulates a withdrawal plan that ignores deposits already reserved by `exclude`.
    ///
    /// Fails with [`SimulationError::NoCollateral`] when nothing can be withdrawn.
    fn withdrawal_plan_excluding<'a>(
        &'a self,
        request: &'a PlanRequest,
        exclude: &'a WithdrawalPlan,
        block: u64,
    ) -> BoxFuture<'a, Result<WithdrawalPlan>>;

    fn combine_withdrawal_plans<'a>(
        &'a self,
        plans: &'a [WithdrawalPlan],
        block: u64,
    ) -> BoxFuture<'a, Result<WithdrawalPlan>>;

    fn harvestable_index(&self, field_id: U256, block: u64) -> BoxFuture<'_, Result<U256>>;

    fn stem_tip_for_token(&self, token: Address, block: u64) -> BoxFuture<'_, Result<I256>>;
}

/// Bean price lookup.
pub trait PriceFeed: Send + Sync {
    /// Price in the stable unit, 6 decimals.
    fn price_at(&self, block: u64) -> BoxFuture<'_, Result<U256>>;
}
