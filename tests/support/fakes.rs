use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use alloy_primitives::{Address, I256, U256};
use anyhow::{bail, Result};
use futures::future::BoxFuture;
use tractor_indexer::chain::{
    ChainState, ConvertSnapshot, FieldSnapshot, PlanRequest, PriceFeed, SimulationError,
    WithdrawalPlan,
};
use tractor_indexer::{Event, EventKind, EventSource};

use super::helpers::BEAN;

pub const SEASON: u32 = 7;
pub const HARVESTABLE_INDEX: u64 = 400_000;

/// Chain whose field always accepts sow orders and where each publisher owns a
/// single pool of beans. Block-pinned reads yield once, like a node round trip.
pub struct StaticChain {
    pub field: FieldSnapshot,
    pools: HashMap<Address, U256>,
}

impl StaticChain {
    pub fn new() -> Self {
        Self {
            field: FieldSnapshot {
                temperature: U256::from(5_000_000u64),
                podline_length: U256::from(1_000_000_000u64),
                soil: U256::from(1_000_000_000u64),
            },
            pools: HashMap::new(),
        }
    }

    pub fn with_pool(mut self, publisher: Address, beans: u64) -> Self {
        self.pools.insert(publisher, U256::from(beans));
        self
    }
}

impl ChainState for StaticChain {
    fn season(&self, _block: u64) -> BoxFuture<'_, Result<u32>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            Ok(SEASON)
        })
    }

    fn field_snapshot(&self, _block: u64) -> BoxFuture<'_, Result<FieldSnapshot>> {
        Box::pin(async move { Ok(self.field) })
    }

    fn convert_snapshot(&self, _block: u64) -> BoxFuture<'_, Result<ConvertSnapshot>> {
        Box::pin(async move { Ok(ConvertSnapshot::default()) })
    }

    fn withdrawal_plan_excluding<'a>(
        &'a self,
        request: &'a PlanRequest,
        exclude: &'a WithdrawalPlan,
        _block: u64,
    ) -> BoxFuture<'a, Result<WithdrawalPlan>> {
        Box::pin(async move {
            let pool = self.pools.get(&request.publisher).copied().unwrap_or_default();
            let amount = pool
                .saturating_sub(exclude.total_available_beans)
                .min(request.amount);
            if amount.is_zero() {
                return Err(SimulationError::NoCollateral.into());
            }
            Ok(WithdrawalPlan {
                source_tokens: vec![BEAN],
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
        Box::pin(async move {
            tokio::task::yield_now().await;
            Ok(U256::from(HARVESTABLE_INDEX))
        })
    }

    fn stem_tip_for_token(&self, _token: Address, _block: u64) -> BoxFuture<'_, Result<I256>> {
        Box::pin(async move { Ok(I256::ZERO) })
    }
}

pub struct FixedPrice(pub U256);

impl PriceFeed for FixedPrice {
    fn price_at(&self, _block: u64) -> BoxFuture<'_, Result<U256>> {
        Box::pin(async move { Ok(self.0) })
    }
}

/// Event source serving a fixed list of events below a movable chain head.
#[derive(Default)]
pub struct ScriptedSource {
    head: AtomicU64,
    events: Mutex<Vec<Event>>,
    fail_fetches: AtomicBool,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(head: u64, events: Vec<Event>) -> Self {
        Self {
            head: AtomicU64::new(head),
            events: Mutex::new(events),
            ..Self::default()
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl EventSource for ScriptedSource {
    fn chain_head(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.head.load(Ordering::SeqCst)) })
    }

    fn fetch_events<'a>(
        &'a self,
        kinds: &'a [EventKind],
        from: u64,
        to: u64,
    ) -> BoxFuture<'a, Result<Vec<Event>>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetches.load(Ordering::SeqCst) {
                bail!("node unavailable");
            }
            let mut events: Vec<Event> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| {
                    (from..=to).contains(&event.raw_log.block_number)
                        && kinds.contains(&event.kind())
                })
                .cloned()
                .collect();
            events.sort_by_key(|event| (event.raw_log.block_number, event.raw_log.log_index));
            Ok(events)
        })
    }
}
