//! Cascading-funding refresh shared by blueprints whose orders draw on a
//! publisher's deposits.
//!
//! Orders of one publisher compete for the same pool, so they are simulated
//! one after another in priority order, each excluding what earlier orders
//! already reserved. Publishers are independent and simulated concurrently.

use super::{BlueprintTables, PeriodicReport};
use crate::chain::{ChainState, PlanRequest, SimulationError, WithdrawalPlan};
use crate::model::{OrderType, ORDERS};
use crate::processor::concurrent::ConcurrencyGroup;
use crate::store::{Filter, Record, Transaction};
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use std::cmp::Reverse;
use std::collections::HashMap;

const SIMULATE_TAG: &str = "simulate";

/// Side row of an order that takes part in the cascade.
pub trait FundedOrder: Record + Clone + 'static {
    /// Block-pinned conditions the eligibility predicate is evaluated against.
    type Conditions: Sync;

    fn blueprint_hash(&self) -> B256;

    fn last_executable_season(&self) -> Option<u32>;

    fn mark_executable(&mut self, season: u32);

    fn is_eligible(&self, conditions: &Self::Conditions) -> bool;

    fn plan_request(&self, publisher: Address, conditions: &Self::Conditions) -> PlanRequest;

    fn set_funding(&mut self, amount_funded: U256, cascade_amount_funded: U256);
}

/// Inputs of one refresh.
pub struct CascadeRun<'a, C> {
    pub chain: &'a dyn ChainState,
    pub order_type: OrderType,
    pub season: u32,
    pub conditions: &'a C,
    pub block: u64,
    pub concurrency: usize,
}

/// Loads the open orders of `run.order_type`, marks the ones executable this
/// season, and refreshes their funding fields.
pub async fn refresh<R>(
    tx: &dyn Transaction,
    tables: &BlueprintTables<R, impl Record>,
    run: CascadeRun<'_, R::Conditions>,
) -> Result<PeriodicReport>
where
    R: FundedOrder,
{
    let publishers = open_publishers(tx, run.order_type).await?;
    if publishers.is_empty() {
        return Ok(PeriodicReport::default());
    }

    let hashes: Vec<B256> = publishers.keys().copied().collect();
    let open = Filter::new()
        .is_in("blueprint_hash", &hashes)
        .eq("order_complete", false);
    let mut rows = tables.get_orders(tx, &open).await?;

    let mut newly_executable = Vec::new();
    for row in rows.iter_mut() {
        if row.last_executable_season() != Some(run.season) && row.is_eligible(run.conditions) {
            row.mark_executable(run.season);
            newly_executable.push(row.clone());
        }
    }
    tables
        .update_orders(tx, &newly_executable)
        .await
        .context("failed to persist executable seasons")?;

    prioritize(&mut rows);

    let by_publisher = group_by_publisher(rows, &publishers);

    let mut group: ConcurrencyGroup<'_, Vec<R>> = ConcurrencyGroup::new();
    for (publisher, queue) in by_publisher {
        let chain = run.chain;
        let conditions = run.conditions;
        let block = run.block;
        group
            .run(SIMULATE_TAG, run.concurrency, async move {
                simulate_publisher(chain, publisher, queue, conditions, block)
                    .await
                    .with_context(|| format!("funding simulation failed for publisher {publisher}"))
            })
            .await;
    }
    let drained = group.drain_tolerant(SIMULATE_TAG).await;
    for err in &drained.failures {
        tracing::warn!(
            order_type = %run.order_type,
            block = run.block,
            error = %format!("{err:#}"),
            "publisher skipped during funding refresh"
        );
    }

    let refreshed: Vec<R> = drained.outputs.into_iter().flatten().collect();
    tables
        .update_orders(tx, &refreshed)
        .await
        .context("failed to persist funding amounts")?;

    Ok(PeriodicReport {
        newly_executable: newly_executable.len(),
        refreshed: refreshed.len(),
        failed_publishers: drained.failures.len(),
    })
}

/// Splits prioritized rows into per-publisher queues, publishers in order of first appearance.
fn group_by_publisher<R: FundedOrder>(
    rows: Vec<R>,
    publishers: &HashMap<B256, Address>,
) -> Vec<(Address, Vec<R>)> {
    let mut slots: HashMap<Address, usize> = HashMap::new();
    let mut queues: Vec<(Address, Vec<R>)> = Vec::new();
    for row in rows {
        let Some(publisher) = publishers.get(&row.blueprint_hash()).copied() else {
            continue;
        };
        match slots.get(&publisher) {
            Some(&slot) => queues[slot].1.push(row),
            None => {
                slots.insert(publisher, queues.len());
                queues.push((publisher, vec![row]));
            }
        }
    }
    queues
}

/// Executable-this-season first (latest season first), then by blueprint hash.
pub fn prioritize<R: FundedOrder>(rows: &mut [R]) {
    rows.sort_by_key(|row| {
        (
            Reverse(row.last_executable_season().unwrap_or(0)),
            row.blueprint_hash(),
        )
    });
}

/// Funds one publisher's orders in priority order.
pub async fn simulate_publisher<R: FundedOrder>(
    chain: &dyn ChainState,
    publisher: Address,
    mut queue: Vec<R>,
    conditions: &R::Conditions,
    block: u64,
) -> Result<Vec<R>> {
    let cascades = queue.len() > 1;
    let empty = WithdrawalPlan::empty();
    let mut reserved: Vec<WithdrawalPlan> = Vec::new();

    for row in queue.iter_mut() {
        let request = row.plan_request(publisher, conditions);
        let solo = fund(chain, &request, &empty, block).await?;
        let amount_funded = funded_amount(solo.as_ref());

        let cascade_amount_funded = if !cascades {
            amount_funded
        } else {
            let exclusion = if reserved.is_empty() {
                WithdrawalPlan::empty()
            } else {
                chain
                    .combine_withdrawal_plans(&reserved, block)
                    .await
                    .context("failed to combine reserved plans")?
            };
            let plan = fund(chain, &request, &exclusion, block).await?;
            let amount = funded_amount(plan.as_ref());
            reserved.extend(plan);
            amount
        };

        tracing::debug!(
            blueprint_hash = %row.blueprint_hash(),
            %publisher,
            %amount_funded,
            %cascade_amount_funded,
            "order funding simulated"
        );
        row.set_funding(amount_funded, cascade_amount_funded);
    }

    Ok(queue)
}

async fn fund(
    chain: &dyn ChainState,
    request: &PlanRequest,
    exclude: &WithdrawalPlan,
    block: u64,
) -> Result<Option<WithdrawalPlan>> {
    match chain.withdrawal_plan_excluding(request, exclude, block).await {
        Ok(plan) => Ok(Some(plan)),
        Err(err) if SimulationError::is_no_collateral(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

fn funded_amount(plan: Option<&WithdrawalPlan>) -> U256 {
    plan.map(|plan| plan.total_available_beans)
        .unwrap_or(U256::ZERO)
}

/// Publisher of every non-cancelled order of `order_type`, keyed by blueprint hash.
async fn open_publishers(
    tx: &dyn Transaction,
    order_type: OrderType,
) -> Result<HashMap<B256, Address>> {
    let filter = Filter::new()
        .eq("order_type", order_type)
        .eq("cancelled", false);
    let orders = ORDERS.find_all(tx, &filter).await?;
    Ok(orders
        .into_iter()
        .map(|order| (order.blueprint_hash, order.publisher))
        .collect())
}
