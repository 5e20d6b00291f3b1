//! Closed set of known blueprints, consulted in a fixed order.

use super::convert_up_v0::ConvertUpV0;
use super::sow_v0::SowV0;
use super::{Blueprint, BlueprintDeps, BlueprintParams, PeriodicReport};
use crate::events::Event;
use crate::model::{Execution, Order, OrderType};
use crate::store::{Filter, Transaction};
use alloy_primitives::{B256, U256};
use anyhow::Result;
use serde_json::Value;

pub enum KnownBlueprint {
    SowV0(SowV0),
    ConvertUpV0(ConvertUpV0),
}

macro_rules! dispatch {
    ($self:expr, $blueprint:ident => $body:expr) => {
        match $self {
            KnownBlueprint::SowV0($blueprint) => $body,
            KnownBlueprint::ConvertUpV0($blueprint) => $body,
        }
    };
}

impl KnownBlueprint {
    pub fn order_type(&self) -> OrderType {
        match self {
            KnownBlueprint::SowV0(_) => SowV0::ORDER_TYPE,
            KnownBlueprint::ConvertUpV0(_) => ConvertUpV0::ORDER_TYPE,
        }
    }

    pub async fn try_claim(&self, tx: &dyn Transaction, order: &Order) -> Result<Option<U256>> {
        dispatch!(self, blueprint => blueprint.try_claim(tx, order).await)
    }

    pub async fn on_executed(
        &self,
        tx: &dyn Transaction,
        order: &Order,
        execution: &Execution,
        inner_events: &[&Event],
    ) -> Result<Option<U256>> {
        dispatch!(self, blueprint => blueprint.on_executed(tx, order, execution, inner_events).await)
    }

    pub async fn on_cancelled(&self, tx: &dyn Transaction, order: &Order) -> Result<()> {
        dispatch!(self, blueprint => blueprint.on_cancelled(tx, order).await)
    }

    pub async fn periodic_update(
        &self,
        tx: &dyn Transaction,
        from_block: u64,
        to_block: u64,
    ) -> Result<PeriodicReport> {
        dispatch!(self, blueprint => blueprint.periodic_update(tx, from_block, to_block).await)
    }

    pub fn validate_order_params(&self, params: &BlueprintParams) -> Result<()> {
        dispatch!(self, blueprint => blueprint.validate_order_params(params))
    }

    pub fn order_query_filter(&self, params: &BlueprintParams) -> Filter {
        dispatch!(self, blueprint => blueprint.order_query_filter(params))
    }

    pub fn validate_execution_params(&self, params: &BlueprintParams) -> Result<()> {
        dispatch!(self, blueprint => blueprint.validate_execution_params(params))
    }

    pub fn execution_query_filter(&self, params: &BlueprintParams) -> Filter {
        dispatch!(self, blueprint => blueprint.execution_query_filter(params))
    }

    /// Side rows of `hashes` satisfying `extra`, as JSON keyed by blueprint hash.
    pub async fn order_data(
        &self,
        tx: &dyn Transaction,
        hashes: &[B256],
        extra: Filter,
    ) -> Result<Vec<(String, Value)>> {
        match self {
            KnownBlueprint::SowV0(_) => SowV0::TABLES.order_data(tx, hashes, extra).await,
            KnownBlueprint::ConvertUpV0(_) => ConvertUpV0::TABLES.order_data(tx, hashes, extra).await,
        }
    }

    /// Side rows of the executions keyed by `keys` satisfying `extra`.
    pub async fn execution_data(
        &self,
        tx: &dyn Transaction,
        keys: &[String],
        extra: Filter,
    ) -> Result<Vec<(String, Value)>> {
        match self {
            KnownBlueprint::SowV0(_) => SowV0::TABLES.execution_data(tx, keys, extra).await,
            KnownBlueprint::ConvertUpV0(_) => {
                ConvertUpV0::TABLES.execution_data(tx, keys, extra).await
            }
        }
    }
}

/// Known blueprints in classification order.
pub struct BlueprintRegistry {
    blueprints: [KnownBlueprint; 2],
}

impl BlueprintRegistry {
    pub fn new(deps: BlueprintDeps) -> Self {
        Self {
            blueprints: [
                KnownBlueprint::SowV0(SowV0::new(deps.clone())),
                KnownBlueprint::ConvertUpV0(ConvertUpV0::new(deps)),
            ],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnownBlueprint> {
        self.blueprints.iter()
    }

    pub fn get(&self, order_type: OrderType) -> &KnownBlueprint {
        let position = match order_type {
            OrderType::SowV0 => 0,
            OrderType::ConvertUpV0 => 1,
        };
        &self.blueprints[position]
    }

    /// Offers `order` to each blueprint in turn; the first to claim it wins.
    pub async fn classify(
        &self,
        tx: &dyn Transaction,
        order: &Order,
    ) -> Result<Option<(OrderType, U256)>> {
        for blueprint in self.iter() {
            if let Some(tip) = blueprint.try_claim(tx, order).await? {
                return Ok(Some((blueprint.order_type(), tip)));
            }
        }
        Ok(None)
    }
}
