//! Sow orders: periodically sow beans withdrawn from the publisher's deposits
//! while field conditions hold.

use super::cascade::{self, CascadeRun, FundedOrder};
use super::envelope::{self, OperatorParams};
use super::settlement::{resolve_tip, withdrawn_deposits};
use super::{
    order_complete_param, used_token_param, Blueprint, BlueprintDeps, BlueprintParams,
    BlueprintTables, PeriodicReport,
};
use crate::abi::{self, AbiReader, Token};
use crate::chain::{FieldSnapshot, PlanFilter, PlanRequest};
use crate::events::{Event, EventArgs, Sown};
use crate::model::{Execution, Order, OrderType};
use crate::store::{Filter, Record, Transaction};
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

pub static SOW_BLUEPRINT_V0: Lazy<[u8; 4]> = Lazy::new(|| {
    abi::selector(
        "sowBlueprintv0(((uint8[],(uint256,uint256,uint256),uint256,uint256,uint256,uint256,uint256),(address[],address,int256)))",
    )
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SowParams {
    pub source_token_indices: Vec<u8>,
    pub total_amount_to_sow: U256,
    pub min_amount_to_sow_per_season: U256,
    pub max_amount_to_sow_per_season: U256,
    pub min_temp: U256,
    pub max_podline_length: U256,
    pub max_grown_stalk_per_bdv: U256,
    pub run_blocks_after_sunrise: U256,
    pub slippage_ratio: U256,
}

/// Decoded `sowBlueprintv0` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SowV0Call {
    pub sow: SowParams,
    pub operator: OperatorParams,
}

impl SowV0Call {
    pub fn decode(call_data: &[u8]) -> Option<Self> {
        let args = AbiReader::call(call_data, *SOW_BLUEPRINT_V0)?;
        let params = args.tail(0)?;
        let sow = params.tail(0)?;
        let operator = params.tail(1)?;
        Some(Self {
            sow: SowParams {
                source_token_indices: sow.uint8_array(0)?,
                total_amount_to_sow: sow.uint(1)?,
                min_amount_to_sow_per_season: sow.uint(2)?,
                max_amount_to_sow_per_season: sow.uint(3)?,
                min_temp: sow.uint(4)?,
                max_podline_length: sow.uint(5)?,
                max_grown_stalk_per_bdv: sow.uint(6)?,
                run_blocks_after_sunrise: sow.uint(7)?,
                slippage_ratio: sow.uint(8)?,
            },
            operator: OperatorParams::decode(&operator)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let sow = &self.sow;
        abi::encode_call(
            *SOW_BLUEPRINT_V0,
            &[Token::Tuple(vec![
                Token::Tuple(vec![
                    Token::Array(
                        sow.source_token_indices
                            .iter()
                            .map(|index| Token::uint(U256::from(*index)))
                            .collect(),
                    ),
                    Token::Tuple(vec![
                        Token::uint(sow.total_amount_to_sow),
                        Token::uint(sow.min_amount_to_sow_per_season),
                        Token::uint(sow.max_amount_to_sow_per_season),
                    ]),
                    Token::uint(sow.min_temp),
                    Token::uint(sow.max_podline_length),
                    Token::uint(sow.max_grown_stalk_per_bdv),
                    Token::uint(sow.run_blocks_after_sunrise),
                    Token::uint(sow.slippage_ratio),
                ]),
                self.operator.token(),
            ])],
        )
    }
}

/// Side row kept for every sow order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SowOrderData {
    pub blueprint_hash: B256,
    pub source_token_indices: Vec<u8>,
    pub total_amount_to_sow: U256,
    pub min_amount_to_sow_per_season: U256,
    pub max_amount_to_sow_per_season: U256,
    pub min_temp: U256,
    pub max_podline_length: U256,
    pub max_grown_stalk_per_bdv: U256,
    pub run_blocks_after_sunrise: U256,
    pub slippage_ratio: U256,
    pub pinto_sown_counter: U256,
    pub last_executed_season: Option<u32>,
    pub last_executable_season: Option<u32>,
    pub order_complete: bool,
    pub amount_funded: U256,
    pub cascade_amount_funded: U256,
}

impl SowOrderData {
    pub fn from_call(blueprint_hash: B256, call: &SowV0Call) -> Self {
        let sow = &call.sow;
        Self {
            blueprint_hash,
            source_token_indices: sow.source_token_indices.clone(),
            total_amount_to_sow: sow.total_amount_to_sow,
            min_amount_to_sow_per_season: sow.min_amount_to_sow_per_season,
            max_amount_to_sow_per_season: sow.max_amount_to_sow_per_season,
            min_temp: sow.min_temp,
            max_podline_length: sow.max_podline_length,
            max_grown_stalk_per_bdv: sow.max_grown_stalk_per_bdv,
            run_blocks_after_sunrise: sow.run_blocks_after_sunrise,
            slippage_ratio: sow.slippage_ratio,
            pinto_sown_counter: U256::ZERO,
            last_executed_season: None,
            last_executable_season: None,
            order_complete: false,
            amount_funded: U256::ZERO,
            cascade_amount_funded: U256::ZERO,
        }
    }

    pub fn remaining(&self) -> U256 {
        self.total_amount_to_sow
            .saturating_sub(self.pinto_sown_counter)
    }

    /// Applies one observed sow.
    pub fn record_sow(&mut self, sown: &Sown, season: u32) {
        self.pinto_sown_counter = self.pinto_sown_counter.saturating_add(sown.beans);
        self.last_executed_season = Some(season);
        self.order_complete = self.pinto_sown_counter >= self.total_amount_to_sow;
    }
}

impl Record for SowOrderData {
    fn key(&self) -> String {
        self.blueprint_hash.to_string()
    }
}

impl FundedOrder for SowOrderData {
    type Conditions = FieldSnapshot;

    fn blueprint_hash(&self) -> B256 {
        self.blueprint_hash
    }

    fn last_executable_season(&self) -> Option<u32> {
        self.last_executable_season
    }

    fn mark_executable(&mut self, season: u32) {
        self.last_executable_season = Some(season);
    }

    fn is_eligible(&self, field: &FieldSnapshot) -> bool {
        field.temperature >= self.min_temp
            && field.podline_length <= self.max_podline_length
            && !field.soil.is_zero()
    }

    fn plan_request(&self, publisher: Address, _field: &FieldSnapshot) -> PlanRequest {
        PlanRequest {
            publisher,
            source_token_indices: self.source_token_indices.clone(),
            amount: self.remaining().min(self.max_amount_to_sow_per_season),
            filter: PlanFilter::unbounded(self.max_grown_stalk_per_bdv),
        }
    }

    fn set_funding(&mut self, amount_funded: U256, cascade_amount_funded: U256) {
        self.amount_funded = amount_funded;
        self.cascade_amount_funded = cascade_amount_funded;
    }
}

/// Side row kept for every sow execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SowExecutionData {
    /// Same key as the generic execution row.
    pub id: String,
    pub blueprint_hash: B256,
    pub index: U256,
    pub beans: U256,
    pub pods: U256,
    pub place_in_line: U256,
    pub used_token_indices: Vec<u8>,
    pub used_grown_stalk_per_bdv: Option<U256>,
}

impl Record for SowExecutionData {
    fn key(&self) -> String {
        self.id.clone()
    }
}

pub struct SowV0 {
    deps: BlueprintDeps,
}

impl SowV0 {
    pub fn new(deps: BlueprintDeps) -> Self {
        Self { deps }
    }

    async fn claim(&self, tx: &dyn Transaction, order: &Order) -> Result<Option<U256>> {
        let Some(call) = self.decode(&order.data) else {
            return Ok(None);
        };
        let tables = &Self::TABLES;
        let existing = tables.orders.get(tx, &order.blueprint_hash.to_string()).await?;
        if existing.is_none() {
            let row = SowOrderData::from_call(order.blueprint_hash, &call);
            tables.update_orders(tx, &[row]).await?;
        }
        Ok(Some(call.operator.offered_tip()))
    }

    async fn executed(
        &self,
        tx: &dyn Transaction,
        order: &Order,
        execution: &Execution,
        inner_events: &[&Event],
    ) -> Result<Option<U256>> {
        let tables = &Self::TABLES;
        let sown = inner_events.iter().find_map(|event| match &event.args {
            EventArgs::Sow(sown) => Some((sown, event.raw_log.block_number)),
            _ => None,
        });

        match sown {
            Some((sown, block)) => {
                let mut row = tables.get_order(tx, &order.blueprint_hash).await?;
                let chain = self.deps.chain.as_ref();
                let season = chain
                    .season(block)
                    .await
                    .with_context(|| format!("failed to read season at block {block}"))?;
                row.record_sow(sown, season);
                tables.update_orders(tx, &[row]).await?;

                let harvestable = chain
                    .harvestable_index(sown.field_id, block)
                    .await
                    .with_context(|| format!("failed to read harvestable index at block {block}"))?;
                let withdrawn = withdrawn_deposits(chain, &self.deps.settings, inner_events).await?;
                let data = SowExecutionData {
                    id: execution.key(),
                    blueprint_hash: order.blueprint_hash,
                    index: sown.index,
                    beans: sown.beans,
                    pods: sown.pods,
                    place_in_line: sown.index.saturating_sub(harvestable),
                    used_token_indices: withdrawn.used_token_indices,
                    used_grown_stalk_per_bdv: withdrawn.used_grown_stalk_per_bdv,
                };
                tables.update_executions(tx, &[data]).await?;
            }
            None => tracing::warn!(
                blueprint_hash = %order.blueprint_hash,
                nonce = %execution.nonce,
                "sow execution without a Sow event"
            ),
        }

        resolve_tip(self.deps.prices.as_ref(), self.deps.settings.bean, inner_events).await
    }

    async fn cancelled(&self, tx: &dyn Transaction, order: &Order) -> Result<()> {
        let tables = &Self::TABLES;
        let mut row = tables.get_order(tx, &order.blueprint_hash).await?;
        row.set_funding(U256::ZERO, U256::ZERO);
        tables.update_orders(tx, &[row]).await
    }

    async fn refresh(&self, tx: &dyn Transaction, to_block: u64) -> Result<PeriodicReport> {
        let chain = self.deps.chain.as_ref();
        let season = chain
            .season(to_block)
            .await
            .with_context(|| format!("failed to read season at block {to_block}"))?;
        let field = chain
            .field_snapshot(to_block)
            .await
            .with_context(|| format!("failed to read field at block {to_block}"))?;
        cascade::refresh(
            tx,
            &Self::TABLES,
            CascadeRun {
                chain,
                order_type: Self::ORDER_TYPE,
                season,
                conditions: &field,
                block: to_block,
                concurrency: self.deps.simulation_concurrency,
            },
        )
        .await
    }
}

impl Blueprint for SowV0 {
    type Call = SowV0Call;
    type OrderData = SowOrderData;
    type ExecutionData = SowExecutionData;

    const ORDER_TYPE: OrderType = OrderType::SowV0;
    const TABLES: BlueprintTables<SowOrderData, SowExecutionData> =
        BlueprintTables::new("tractor_order_sow_v0", "tractor_execution_sow_v0");

    fn decode(&self, data: &[u8]) -> Option<SowV0Call> {
        envelope::call_for(data, self.deps.settings.sow_v0).and_then(SowV0Call::decode)
    }

    fn try_claim<'a>(
        &'a self,
        tx: &'a dyn Transaction,
        order: &'a Order,
    ) -> BoxFuture<'a, Result<Option<U256>>> {
        Box::pin(self.claim(tx, order))
    }

    fn on_executed<'a>(
        &'a self,
        tx: &'a dyn Transaction,
        order: &'a Order,
        execution: &'a Execution,
        inner_events: &'a [&'a Event],
    ) -> BoxFuture<'a, Result<Option<U256>>> {
        Box::pin(self.executed(tx, order, execution, inner_events))
    }

    fn on_cancelled<'a>(
        &'a self,
        tx: &'a dyn Transaction,
        order: &'a Order,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.cancelled(tx, order))
    }

    fn periodic_update<'a>(
        &'a self,
        tx: &'a dyn Transaction,
        _from_block: u64,
        to_block: u64,
    ) -> BoxFuture<'a, Result<PeriodicReport>> {
        Box::pin(self.refresh(tx, to_block))
    }

    fn validate_order_params(&self, params: &BlueprintParams) -> Result<()> {
        order_complete_param(params).map(drop)
    }

    fn order_query_filter(&self, params: &BlueprintParams) -> Filter {
        match order_complete_param(params) {
            Ok(Some(complete)) => Filter::new().eq("order_complete", complete),
            _ => Filter::new(),
        }
    }

    fn validate_execution_params(&self, params: &BlueprintParams) -> Result<()> {
        used_token_param(&self.deps.settings, params).map(drop)
    }

    fn execution_query_filter(&self, params: &BlueprintParams) -> Filter {
        match used_token_param(&self.deps.settings, params) {
            Ok(Some(index)) => Filter::new().array_contains("used_token_indices", index),
            _ => Filter::new(),
        }
    }
}
