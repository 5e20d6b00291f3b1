//! In-memory collaborators for unit tests.

use crate::chain::{
    ChainState, ConvertSnapshot, FieldSnapshot, PlanRequest, PriceFeed, SimulationError,
    WithdrawalPlan,
};
use crate::runtime::config::BlueprintSettings;
use alloy_primitives::{Address, I256, U256};
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) fn settings() -> BlueprintSettings {
    BlueprintSettings {
        sow_v0: Address::repeat_byte(0xa1),
        convert_up_v0: Address::repeat_byte(0xa2),
        bean: Address::repeat_byte(0xb0),
        silo_tokens: vec![Address::repeat_byte(0xb0), Address::repeat_byte(0xb1)],
    }
}

/// Chain double where each publisher owns one pool of beans.
#[derive(Debug, Default)]
pub(crate) struct FakeChain {
    pub season: u32,
    pub field: FieldSnapshot,
    pub convert: ConvertSnapshot,
    pub pools: HashMap<Address, U256>,
    pub failing_publishers: HashSet<Address>,
    pub stem_tip: I256,
    pub harvestable_index: U256,
    pub plan_calls: AtomicUsize,
}

impl FakeChain {
    pub fn with_pool(mut self, publisher: Address, beans: u64) -> Self {
        self.pools.insert(publisher, U256::from(beans));
        self
    }

    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }
}

impl ChainState for FakeChain {
    fn season(&self, _block: u64) -> BoxFuture<'_, Result<u32>> {
        Box::pin(async move { Ok(self.season) })
    }

    fn field_snapshot(&self, _block: u64) -> BoxFuture<'_, Result<FieldSnapshot>> {
        Box::pin(async move { Ok(self.field) })
    }

    fn convert_snapshot(&self, _block: u64) -> BoxFuture<'_, Result<ConvertSnapshot>> {
        Box::pin(async move { Ok(self.convert) })
    }

    fn withdrawal_plan_excluding<'a>(
        &'a self,
        request: &'a PlanRequest,
        exclude: &'a WithdrawalPlan,
        _block: u64,
    ) -> BoxFuture<'a, Result<WithdrawalPlan>> {
        Box::pin(async move {
            self.plan_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.failing_publishers.contains(&request.publisher) {
                return Err(anyhow!("simulation reverted for {}", request.publisher));
            }
            let pool = self.pools.get(&request.publisher).copied().unwrap_or_default();
            let available = pool.saturating_sub(exclude.total_available_beans);
            let amount = available.min(request.amount);
            if amount.is_zero() {
                return Err(SimulationError::NoCollateral.into());
            }
            Ok(WithdrawalPlan {
                source_tokens: vec![Address::repeat_byte(0xb0)],
                stems: vec![vec![I256::ZERO]],
                amounts: vec![vec![amount]],
                available_beans: vec![amount],
                total_available_beans: amount,
            })
        })
    }

    fn combine_withdrawal_plans<'a>(
        &'a self,
        plans: &'a [WithdrawalPlan],
        _block: u64,
    ) -> BoxFuture<'a, Result<WithdrawalPlan>> {
        Box::pin(async move {
            let mut combined = WithdrawalPlan::empty();
            for plan in plans {
                combined.source_tokens.extend(plan.source_tokens.iter().copied());
                combined.stems.extend(plan.stems.iter().cloned());
                combined.amounts.extend(plan.amounts.iter().cloned());
                combined.available_beans.extend(plan.available_beans.iter().copied());
                combined.total_available_beans += plan.total_available_beans;
            }
            Ok(combined)
        })
    }

    fn harvestable_index(&self, _field_id: U256, _block: u64) -> BoxFuture<'_, Result<U256>> {
        Box::pin(async move { Ok(self.harvestable_index) })
    }

    fn stem_tip_for_token(&self, _token: Address, _block: u64) -> BoxFuture<'_, Result<I256>> {
        Box::pin(async move { Ok(self.stem_tip) })
    }
}

pub(crate) struct FixedPrice(pub U256);

impl PriceFeed for FixedPrice {
    fn price_at(&self, _block: u64) -> BoxFuture<'_, Result<U256>> {
        Box::pin(async move { Ok(self.0) })
    }
}
