//! Convert-up orders: convert LP deposits back into beans while the price and
//! the seasonal convert bonus sit inside the publisher's bounds.

use super::cascade::{self, CascadeRun, FundedOrder};
use super::envelope::{self, OperatorParams};
use super::settlement::{resolve_tip, withdrawn_deposits};
use super::{
    order_complete_param, used_token_param, Blueprint, BlueprintDeps, BlueprintParams,
    BlueprintTables, PeriodicReport,
};
use crate::abi::{self, AbiReader, Token};
use crate::chain::{ConvertSnapshot, LowStalkMode, PlanFilter, PlanRequest};
use crate::events::{Event, EventArgs};
use crate::model::{Execution, Order, OrderType};
use crate::store::{Filter, Record, Transaction};
use alloy_primitives::{Address, B256, I256, U256};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

pub static CONVERT_UP_BLUEPRINT_V0: Lazy<[u8; 4]> = Lazy::new(|| {
    abi::selector(
        "convertUpBlueprintv0(((uint8[],uint256,uint256,uint256,uint256,uint256,uint256,uint256,int256,uint8,uint256),(address[],address,int256)))",
    )
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertUpParams {
    pub source_token_indices: Vec<u8>,
    pub total_bean_amount_to_convert: U256,
    pub min_bean_amount_per_convert: U256,
    pub max_bean_amount_per_convert: U256,
    pub min_price_to_convert_up: U256,
    pub max_price_to_convert_up: U256,
    pub min_convert_bonus_capacity: U256,
    pub max_grown_stalk_per_bdv: U256,
    pub seed_difference: I256,
    pub low_stalk_deposits: LowStalkMode,
    pub slippage_ratio: U256,
}

/// Decoded `convertUpBlueprintv0` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertUpV0Call {
    pub convert_up: ConvertUpParams,
    pub operator: OperatorParams,
}

impl ConvertUpV0Call {
    pub fn decode(call_data: &[u8]) -> Option<Self> {
        let args = AbiReader::call(call_data, *CONVERT_UP_BLUEPRINT_V0)?;
        let params = args.tail(0)?;
        let convert = params.tail(0)?;
        let operator = params.tail(1)?;
        Some(Self {
            convert_up: ConvertUpParams {
                source_token_indices: convert.uint8_array(0)?,
                total_bean_amount_to_convert: convert.uint(1)?,
                min_bean_amount_per_convert: convert.uint(2)?,
                max_bean_amount_per_convert: convert.uint(3)?,
                min_price_to_convert_up: convert.uint(4)?,
                max_price_to_convert_up: convert.uint(5)?,
                min_convert_bonus_capacity: convert.uint(6)?,
                max_grown_stalk_per_bdv: convert.uint(7)?,
                seed_difference: convert.int(8)?,
                low_stalk_deposits: LowStalkMode::from_index(convert.uint8(9)?)?,
                slippage_ratio: convert.uint(10)?,
            },
            operator: OperatorParams::decode(&operator)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let convert = &self.convert_up;
        abi::encode_call(
            *CONVERT_UP_BLUEPRINT_V0,
            &[Token::Tuple(vec![
                Token::Tuple(vec![
                    Token::Array(
                        convert
                            .source_token_indices
                            .iter()
                            .map(|index| Token::uint(U256::from(*index)))
                            .collect(),
                    ),
                    Token::uint(convert.total_bean_amount_to_convert),
                    Token::uint(convert.min_bean_amount_per_convert),
                    Token::uint(convert.max_bean_amount_per_convert),
                    Token::uint(convert.min_price_to_convert_up),
                    Token::uint(convert.max_price_to_convert_up),
                    Token::uint(convert.min_convert_bonus_capacity),
                    Token::uint(convert.max_grown_stalk_per_bdv),
                    Token::int(convert.seed_difference),
                    Token::uint(U256::from(convert.low_stalk_deposits.index())),
                    Token::uint(convert.slippage_ratio),
                ]),
                self.operator.token(),
            ])],
        )
    }
}

/// Side row kept for every convert-up order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertUpOrderData {
    pub blueprint_hash: B256,
    pub source_token_indices: Vec<u8>,
    pub total_bean_amount_to_convert: U256,
    pub min_bean_amount_per_convert: U256,
    pub max_bean_amount_per_convert: U256,
    pub min_price_to_convert_up: U256,
    pub max_price_to_convert_up: U256,
    pub min_convert_bonus_capacity: U256,
    pub max_grown_stalk_per_bdv: U256,
    pub seed_difference: I256,
    pub low_stalk_deposits: LowStalkMode,
    pub slippage_ratio: U256,
    pub beans_left_to_convert: U256,
    pub last_executed_season: Option<u32>,
    pub last_executable_season: Option<u32>,
    pub order_complete: bool,
    pub amount_funded: U256,
    pub cascade_amount_funded: U256,
}

impl ConvertUpOrderData {
    pub fn from_call(blueprint_hash: B256, call: &ConvertUpV0Call) -> Self {
        let convert = &call.convert_up;
        Self {
            blueprint_hash,
            source_token_indices: convert.source_token_indices.clone(),
            total_bean_amount_to_convert: convert.total_bean_amount_to_convert,
            min_bean_amount_per_convert: convert.min_bean_amount_per_convert,
            max_bean_amount_per_convert: convert.max_bean_amount_per_convert,
            min_price_to_convert_up: convert.min_price_to_convert_up,
            max_price_to_convert_up: convert.max_price_to_convert_up,
            min_convert_bonus_capacity: convert.min_convert_bonus_capacity,
            max_grown_stalk_per_bdv: convert.max_grown_stalk_per_bdv,
            seed_difference: convert.seed_difference,
            low_stalk_deposits: convert.low_stalk_deposits,
            slippage_ratio: convert.slippage_ratio,
            beans_left_to_convert: convert.total_bean_amount_to_convert,
            last_executed_season: None,
            last_executable_season: None,
            order_complete: false,
            amount_funded: U256::ZERO,
            cascade_amount_funded: U256::ZERO,
        }
    }

    pub fn record_convert(&mut self, beans_converted: U256, season: u32) {
        self.beans_left_to_convert = self.beans_left_to_convert.saturating_sub(beans_converted);
        self.last_executed_season = Some(season);
        self.order_complete = self.beans_left_to_convert.is_zero();
    }
}

impl Record for ConvertUpOrderData {
    fn key(&self) -> String {
        self.blueprint_hash.to_string()
    }
}

impl FundedOrder for ConvertUpOrderData {
    type Conditions = ConvertSnapshot;

    fn blueprint_hash(&self) -> B256 {
        self.blueprint_hash
    }

    fn last_executable_season(&self) -> Option<u32> {
        self.last_executable_season
    }

    fn mark_executable(&mut self, season: u32) {
        self.last_executable_season = Some(season);
    }

    fn is_eligible(&self, convert: &ConvertSnapshot) -> bool {
        (self.min_price_to_convert_up..=self.max_price_to_convert_up).contains(&convert.price)
            && convert.max_seasonal_capacity >= self.min_convert_bonus_capacity
    }

    fn plan_request(&self, publisher: Address, convert: &ConvertSnapshot) -> PlanRequest {
        PlanRequest {
            publisher,
            source_token_indices: self.source_token_indices.clone(),
            amount: self.beans_left_to_convert,
            filter: PlanFilter {
                exclude_bean: true,
                low_stalk_deposits: self.low_stalk_deposits,
                low_grown_stalk_per_bdv: convert.bonus_stalk_per_bdv,
                seed_difference: self.seed_difference,
                ..PlanFilter::unbounded(self.max_grown_stalk_per_bdv)
            },
        }
    }

    fn set_funding(&mut self, amount_funded: U256, cascade_amount_funded: U256) {
        self.amount_funded = amount_funded;
        self.cascade_amount_funded = cascade_amount_funded;
    }
}

/// Side row kept for every convert-up execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertUpExecutionData {
    pub id: String,
    pub blueprint_hash: B256,
    pub beans_converted: U256,
    pub used_token_indices: Vec<u8>,
    pub used_grown_stalk_per_bdv: Option<U256>,
}

impl Record for ConvertUpExecutionData {
    fn key(&self) -> String {
        self.id.clone()
    }
}

pub struct ConvertUpV0 {
    deps: BlueprintDeps,
}

impl ConvertUpV0 {
    pub fn new(deps: BlueprintDeps) -> Self {
        Self { deps }
    }

    async fn claim(&self, tx: &dyn Transaction, order: &Order) -> Result<Option<U256>> {
        let Some(call) = self.decode(&order.data) else {
            return Ok(None);
        };
        let tables = &Self::TABLES;
        if tables
            .orders
            .get(tx, &order.blueprint_hash.to_string())
            .await?
            .is_none()
        {
            let row = ConvertUpOrderData::from_call(order.blueprint_hash, &call);
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
        let bean = self.deps.settings.bean;
        let converts: Vec<_> = inner_events
            .iter()
            .filter_map(|event| match &event.args {
                EventArgs::Convert(converted) => Some(converted),
                _ => None,
            })
            .collect();

        if converts.is_empty() {
            tracing::warn!(
                blueprint_hash = %order.blueprint_hash,
                nonce = %execution.nonce,
                "convert-up execution without a Convert event"
            );
        } else {
            let beans_converted = converts
                .iter()
                .filter(|converted| converted.to_token == bean)
                .fold(U256::ZERO, |total, converted| {
                    total.saturating_add(converted.to_amount)
                });

            let chain = self.deps.chain.as_ref();
            let block = execution.executed_block;
            let season = chain
                .season(block)
                .await
                .with_context(|| format!("failed to read season at block {block}"))?;
            let mut row = tables.get_order(tx, &order.blueprint_hash).await?;
            row.record_convert(beans_converted, season);
            tables.update_orders(tx, &[row]).await?;

            let withdrawn = withdrawn_deposits(chain, &self.deps.settings, inner_events).await?;
            let data = ConvertUpExecutionData {
                id: execution.key(),
                blueprint_hash: order.blueprint_hash,
                beans_converted,
                used_token_indices: withdrawn.used_token_indices,
                used_grown_stalk_per_bdv: withdrawn.used_grown_stalk_per_bdv,
            };
            tables.update_executions(tx, &[data]).await?;
        }

        resolve_tip(self.deps.prices.as_ref(), bean, inner_events).await
    }

    async fn cancelled(&self, tx: &dyn Transaction, order: &Order) -> Result<()> {
        let tables = &Self::TABLES;
        let mut row = tables.get_order(tx, &order.blueprint_hash).await?;
        row.set_funding(U256::ZERO, U256::ZERO);
        tables.update_orders(tx, &[row]).await
    }

    async fn refresh(&self, tx: &dyn Transaction, to_block: u64) -> Result<PeriodicReport> {
        let chain = self.deps.chain.as_ref();
        let (season, convert) = futures::try_join!(
            async {
                chain
                    .season(to_block)
                    .await
                    .with_context(|| format!("failed to read season at block {to_block}"))
            },
            async {
                chain
                    .convert_snapshot(to_block)
                    .await
                    .with_context(|| format!("failed to read convert state at block {to_block}"))
            },
        )?;
        cascade::refresh(
            tx,
            &Self::TABLES,
            CascadeRun {
                chain,
                order_type: Self::ORDER_TYPE,
                season,
                conditions: &convert,
                block: to_block,
                concurrency: self.deps.simulation_concurrency,
            },
        )
        .await
    }
}

impl Blueprint for ConvertUpV0 {
    type Call = ConvertUpV0Call;
    type OrderData = ConvertUpOrderData;
    type ExecutionData = ConvertUpExecutionData;

    const ORDER_TYPE: OrderType = OrderType::ConvertUpV0;
    const TABLES: BlueprintTables<ConvertUpOrderData, ConvertUpExecutionData> =
        BlueprintTables::new("tractor_order_convert_up_v0", "tractor_execution_convert_up_v0");

    fn decode(&self, data: &[u8]) -> Option<ConvertUpV0Call> {
        envelope::call_for(data, self.deps.settings.convert_up_v0).and_then(ConvertUpV0Call::decode)
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
