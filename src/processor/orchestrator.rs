//! One catch-up cycle: plan the next block range, fetch its events, reflect
//! publications, executions and cancellations, refresh blueprint simulations,
//! then advance the watermark, all inside a single transaction.

use super::concurrent::ConcurrencyGroup;
use crate::blueprints::{BlueprintDeps, BlueprintRegistry};
use crate::chain::{ChainState, PriceFeed};
use crate::events::grouping::inner_events;
use crate::events::{Event, EventArgs, EventKind, EventSource, RawLog, Requisition, TractorExecuted};
use crate::model::{Execution, Order, TractorMeta, EXECUTIONS, META, ORDERS, TRACTOR_META_KEY};
use crate::runtime::config::IndexerConfig;
use crate::runtime::error::{CycleError, CycleStage};
use crate::runtime::progress::{plan_from_source, PlanLimits};
use crate::runtime::telemetry::{CycleCounts, Telemetry};
use crate::store::{PersistenceGateway, Transaction};
use alloy_primitives::B256;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;

const PUBLISH_TAG: &str = "publish";
const EXECUTE_TAG: &str = "execute";
const CANCEL_TAG: &str = "cancel";

/// Collaborators wired into an [`Orchestrator`].
pub struct OrchestratorParams {
    pub gateway: Arc<dyn PersistenceGateway>,
    pub source: Arc<dyn EventSource>,
    pub chain: Arc<dyn ChainState>,
    pub prices: Arc<dyn PriceFeed>,
    pub telemetry: Arc<Telemetry>,
}

#[derive(Debug, Clone, Copy)]
struct StageLimits {
    publish: usize,
    execute: usize,
    cancel: usize,
}

/// Drives catch-up cycles against one chain.
pub struct Orchestrator {
    gateway: Arc<dyn PersistenceGateway>,
    source: Arc<dyn EventSource>,
    registry: Arc<BlueprintRegistry>,
    telemetry: Arc<Telemetry>,
    limits: PlanLimits,
    stages: StageLimits,
}

impl Orchestrator {
    pub fn new(config: &IndexerConfig, params: OrchestratorParams) -> Self {
        let OrchestratorParams {
            gateway,
            source,
            chain,
            prices,
            telemetry,
        } = params;

        let registry = Arc::new(BlueprintRegistry::new(BlueprintDeps {
            chain,
            prices,
            settings: config.blueprints().clone(),
            simulation_concurrency: config.simulation_concurrency(),
        }));

        Self {
            gateway,
            source,
            registry,
            telemetry,
            limits: PlanLimits {
                max_blocks: config.max_blocks_per_cycle(),
                confirmation_buffer: config.confirmation_buffer(),
                max_return_block: config.max_return_block(),
            },
            stages: StageLimits {
                publish: config.publish_concurrency(),
                execute: config.execute_concurrency(),
                cancel: config.cancel_concurrency(),
            },
        }
    }

    /// Shared with read-side services such as [`TractorQueries`](crate::query::TractorQueries).
    pub fn registry(&self) -> &Arc<BlueprintRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Seeds the watermark so the first cycle starts at `start_block`.
    ///
    /// Returns `false` when a watermark already exists; it is never moved back.
    pub async fn initialize(&self, start_block: u64) -> Result<bool> {
        let tx = self
            .gateway
            .begin()
            .await
            .context("failed to open initialization transaction")?;

        let existing = match META.get(tx.as_ref(), TRACTOR_META_KEY).await {
            Ok(meta) => meta.unwrap_or_default(),
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            }
        };
        if existing.last_update.is_some() {
            tx.rollback().await?;
            return Ok(false);
        }

        let seeded = TractorMeta {
            last_update: Some(start_block.saturating_sub(1)),
        };
        if let Err(err) = META.upsert(tx.as_ref(), &[seeded]).await {
            tx.rollback().await?;
            return Err(err);
        }
        tx.commit().await.context("failed to commit watermark seed")?;
        tracing::info!(start_block, "tractor watermark initialized");
        Ok(true)
    }

    /// Runs one cycle. Returns `true` when more blocks remain to be indexed.
    ///
    /// Failures are reported as [`CycleError`] after the cycle's writes were
    /// rolled back.
    pub async fn run_cycle(&self) -> Result<bool> {
        match self.cycle().await {
            Ok(more) => Ok(more),
            Err(err) => {
                self.telemetry.record_cycle_failed();
                tracing::error!(stage = ?err.stage(), error = %err, "tractor cycle failed");
                Err(err.into())
            }
        }
    }

    async fn cycle(&self) -> Result<bool, CycleError> {
        let tx = self
            .gateway
            .begin()
            .await
            .map_err(|err| CycleError::new(CycleStage::Begin, err))?;

        let result = self.cycle_in(tx.as_ref()).await;
        match result {
            Ok(Some(outcome)) => {
                tx.commit()
                    .await
                    .map_err(|err| CycleError::new(CycleStage::Commit, err))?;
                self.telemetry.record_cycle_completed(outcome.blocks);
                self.telemetry.record_cycle_counts(outcome.counts);
                tracing::info!(
                    start_block = outcome.from,
                    end_block = outcome.to,
                    published = outcome.counts.published,
                    classified = outcome.counts.classified,
                    executed = outcome.counts.executed,
                    cancelled = outcome.counts.cancelled,
                    caught_up = !outcome.more,
                    "tractor cycle committed"
                );
                Ok(outcome.more)
            }
            Ok(None) => {
                tx.rollback()
                    .await
                    .map_err(|err| CycleError::new(CycleStage::Commit, err))?;
                Ok(false)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback after failed cycle also failed");
                }
                Err(err)
            }
        }
    }

    async fn cycle_in(&self, tx: &dyn Transaction) -> Result<Option<CycleOutcome>, CycleError> {
        let plan = async {
            let meta = META
                .get(tx, TRACTOR_META_KEY)
                .await?
                .unwrap_or_default();
            plan_from_source(meta, self.source.as_ref(), self.limits).await
        }
        .await
        .map_err(|err| CycleError::new(CycleStage::Plan, err))?;

        if !plan.is_initialized {
            tracing::info!("tractor watermark not initialized; skipping cycle");
            return Ok(None);
        }
        let Some((from, to)) = plan.range() else {
            tracing::debug!(last_update = ?plan.last_update, "no new blocks to index");
            return Ok(None);
        };
        tracing::info!(start_block = from, end_block = to, "updating tractor");

        let events = self
            .source
            .fetch_events(&EventKind::ALL, from, to)
            .await
            .with_context(|| format!("failed to fetch events for [{from}, {to}]"))
            .map_err(|err| CycleError::new(CycleStage::Fetch, err))?;

        let mut counts = CycleCounts::default();

        let (published, classified) = self
            .publish(tx, &events)
            .await
            .map_err(|err| CycleError::new(CycleStage::Publish, err))?;
        counts.published = published;
        counts.classified = classified;

        counts.executed = self
            .execute(tx, &events)
            .await
            .map_err(|err| CycleError::new(CycleStage::Execute, err))?;

        counts.cancelled = self
            .cancel(tx, &events)
            .await
            .map_err(|err| CycleError::new(CycleStage::Cancel, err))?;

        for blueprint in self.registry.iter() {
            let report = blueprint
                .periodic_update(tx, from, to)
                .await
                .with_context(|| format!("{} periodic update failed", blueprint.order_type()))
                .map_err(|err| CycleError::new(CycleStage::PeriodicUpdate, err))?;
            tracing::debug!(
                order_type = %blueprint.order_type(),
                newly_executable = report.newly_executable,
                refreshed = report.refreshed,
                failed_publishers = report.failed_publishers,
                "periodic update finished"
            );
            counts.simulation_failures += report.failed_publishers as u64;
        }

        META.upsert(tx, &[TractorMeta { last_update: Some(to) }])
            .await
            .map_err(|err| CycleError::new(CycleStage::Watermark, err))?;

        Ok(Some(CycleOutcome {
            from,
            to,
            blocks: to - from + 1,
            more: !plan.is_caught_up,
            counts,
        }))
    }

    async fn publish(&self, tx: &dyn Transaction, events: &[Event]) -> Result<(u64, u64)> {
        let mut group: ConcurrencyGroup<'_, bool> = ConcurrencyGroup::new();
        let mut published = 0u64;
        for event in events {
            let EventArgs::PublishRequisition(requisition) = &event.args else {
                continue;
            };
            published += 1;
            group
                .run(
                    PUBLISH_TAG,
                    self.stages.publish,
                    self.publish_one(tx, requisition, &event.raw_log),
                )
                .await;
        }
        let outcomes = group.drain_propagating(PUBLISH_TAG).await?;
        let classified = outcomes.into_iter().filter(|classified| *classified).count() as u64;
        Ok((published, classified))
    }

    async fn publish_one(
        &self,
        tx: &dyn Transaction,
        requisition: &Requisition,
        raw_log: &RawLog,
    ) -> Result<bool> {
        let hash = requisition.blueprint_hash;
        let existing = ORDERS.get(tx, &hash.to_string()).await?;
        let mut order = order_from(requisition, raw_log).merge_existing(existing.as_ref());

        let mut classified = false;
        if order.order_type.is_none() {
            if let Some((order_type, tip)) = self
                .registry
                .classify(tx, &order)
                .await
                .with_context(|| format!("failed to classify order {hash}"))?
            {
                order.order_type = Some(order_type);
                order.tip_amount = Some(tip);
                classified = true;
            }
        }

        ORDERS.upsert(tx, &[order.clone()]).await?;
        tracing::debug!(
            blueprint_hash = %hash,
            publisher = %order.publisher,
            order_type = ?order.order_type,
            "requisition recorded"
        );
        Ok(classified)
    }

    /// Executions of one order share its side row, so each order gets a single
    /// unit that applies its executions in (block, log index) order.
    async fn execute(&self, tx: &dyn Transaction, events: &[Event]) -> Result<u64> {
        let mut group: ConcurrencyGroup<'_, u64> = ConcurrencyGroup::new();
        for (_, executions) in executions_by_order(events) {
            group
                .run(
                    EXECUTE_TAG,
                    self.stages.execute,
                    self.execute_order(tx, executions, events),
                )
                .await;
        }
        let recorded = group.drain_propagating(EXECUTE_TAG).await?;
        Ok(recorded.into_iter().sum())
    }

    async fn execute_order(
        &self,
        tx: &dyn Transaction,
        executions: Vec<(&TractorExecuted, &Event)>,
        events: &[Event],
    ) -> Result<u64> {
        let mut recorded = 0;
        for (tractor, event) in executions {
            let inner = inner_events(event, events);
            if self.execute_one(tx, tractor, &event.raw_log, inner).await? {
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    async fn execute_one(
        &self,
        tx: &dyn Transaction,
        tractor: &TractorExecuted,
        raw_log: &RawLog,
        inner: Vec<&Event>,
    ) -> Result<bool> {
        let hash = tractor.blueprint_hash;
        let Some(order) = ORDERS.get(tx, &hash.to_string()).await? else {
            tracing::warn!(
                blueprint_hash = %hash,
                nonce = %tractor.nonce,
                block = raw_log.block_number,
                "execution of an unknown order; skipping"
            );
            return Ok(false);
        };

        let key = Execution::key_for(&hash, &tractor.nonce);
        if EXECUTIONS.get(tx, &key).await?.is_some() {
            tracing::debug!(
                blueprint_hash = %hash,
                nonce = %tractor.nonce,
                "execution already recorded; skipping replay"
            );
            return Ok(false);
        }

        let mut execution = execution_from(tractor, raw_log);
        if let Some(order_type) = order.order_type {
            execution.tip_paid = self
                .registry
                .get(order_type)
                .on_executed(tx, &order, &execution, &inner)
                .await
                .with_context(|| format!("{order_type} execution handling failed for {hash}"))?;
        }

        EXECUTIONS.upsert(tx, &[execution]).await?;
        tracing::debug!(
            blueprint_hash = %hash,
            nonce = %tractor.nonce,
            operator = %tractor.operator,
            inner_events = inner.len(),
            "execution recorded"
        );
        Ok(true)
    }

    async fn cancel(&self, tx: &dyn Transaction, events: &[Event]) -> Result<u64> {
        let mut group: ConcurrencyGroup<'_, bool> = ConcurrencyGroup::new();
        for event in events {
            let EventArgs::CancelBlueprint { blueprint_hash } = &event.args else {
                continue;
            };
            group
                .run(CANCEL_TAG, self.stages.cancel, self.cancel_one(tx, *blueprint_hash))
                .await;
        }
        let cancelled = group.drain_propagating(CANCEL_TAG).await?;
        Ok(cancelled.into_iter().filter(|cancelled| *cancelled).count() as u64)
    }

    async fn cancel_one(&self, tx: &dyn Transaction, hash: B256) -> Result<bool> {
        let Some(mut order) = ORDERS.get(tx, &hash.to_string()).await? else {
            tracing::warn!(blueprint_hash = %hash, "cancellation of an unknown order; skipping");
            return Ok(false);
        };

        order.cancelled = true;
        ORDERS.upsert(tx, &[order.clone()]).await?;
        if let Some(order_type) = order.order_type {
            self.registry
                .get(order_type)
                .on_cancelled(tx, &order)
                .await
                .with_context(|| format!("{order_type} cancellation handling failed for {hash}"))?;
        }
        tracing::debug!(blueprint_hash = %hash, "order cancelled");
        Ok(true)
    }
}

struct CycleOutcome {
    from: u64,
    to: u64,
    blocks: u64,
    more: bool,
    counts: CycleCounts,
}

/// Tractor events grouped by blueprint hash, orders in order of first execution.
fn executions_by_order(events: &[Event]) -> Vec<(B256, Vec<(&TractorExecuted, &Event)>)> {
    let mut slots: HashMap<B256, usize> = HashMap::new();
    let mut orders: Vec<(B256, Vec<(&TractorExecuted, &Event)>)> = Vec::new();
    for event in events {
        let EventArgs::Tractor(tractor) = &event.args else {
            continue;
        };
        let hash = tractor.blueprint_hash;
        match slots.get(&hash) {
            Some(&slot) => orders[slot].1.push((tractor, event)),
            None => {
                slots.insert(hash, orders.len());
                orders.push((hash, vec![(tractor, event)]));
            }
        }
    }
    for (_, executions) in orders.iter_mut() {
        executions.sort_by_key(|(_, event)| (event.raw_log.block_number, event.raw_log.log_index));
    }
    orders
}

fn order_from(requisition: &Requisition, raw_log: &RawLog) -> Order {
    Order {
        blueprint_hash: requisition.blueprint_hash,
        order_type: None,
        publisher: requisition.publisher,
        data: requisition.data.clone(),
        operator_paste_instrs: requisition.operator_paste_instrs.clone(),
        max_nonce: requisition.max_nonce,
        start_time: requisition.start_time.saturating_to(),
        end_time: requisition.end_time.saturating_to(),
        signature: requisition.signature.clone(),
        published_block: raw_log.block_number,
        published_timestamp: raw_log.timestamp,
        tip_amount: None,
        cancelled: false,
    }
}

fn execution_from(tractor: &TractorExecuted, raw_log: &RawLog) -> Execution {
    Execution {
        blueprint_hash: tractor.blueprint_hash,
        nonce: tractor.nonce,
        operator: tractor.operator,
        executed_block: raw_log.block_number,
        executed_timestamp: raw_log.timestamp,
        transaction_hash: raw_log.transaction_hash,
        log_index: raw_log.log_index,
        gas_remaining: tractor.gas_remaining,
        tip_paid: None,
    }
}
