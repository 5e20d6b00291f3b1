//! Known order blueprints: payload decoding, classification, execution
//! bookkeeping and funding simulation for each supported order type.

pub mod cascade;
pub mod convert_up_v0;
pub mod envelope;
pub mod registry;
pub mod settlement;
pub mod sow_v0;

pub use registry::{BlueprintRegistry, KnownBlueprint};

use crate::chain::{ChainState, PriceFeed};
use crate::events::Event;
use crate::model::{Execution, Order, OrderType};
use crate::runtime::config::BlueprintSettings;
use crate::runtime::error::InputError;
use crate::store::{Filter, Record, Table, Transaction};
use alloy_primitives::{B256, U256};
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Free-form, type-specific query parameters (e.g. `orderComplete`, `usedToken`).
pub type BlueprintParams = Map<String, Value>;

/// Collaborators shared by every blueprint.
#[derive(Clone)]
pub struct BlueprintDeps {
    pub chain: Arc<dyn ChainState>,
    pub prices: Arc<dyn PriceFeed>,
    pub settings: BlueprintSettings,
    /// Publishers simulated at once during a periodic update.
    pub simulation_concurrency: usize,
}

impl fmt::Debug for BlueprintDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlueprintDeps")
            .field("settings", &self.settings)
            .field("simulation_concurrency", &self.simulation_concurrency)
            .finish_non_exhaustive()
    }
}

/// Summary of one periodic update.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicReport {
    /// Orders newly found executable this season.
    pub newly_executable: usize,
    /// Orders whose funding fields were refreshed.
    pub refreshed: usize,
    /// Publishers whose simulation failed; their rows keep the previous funding.
    pub failed_publishers: usize,
}

/// Reads the optional boolean `orderComplete` parameter.
pub(crate) fn order_complete_param(params: &BlueprintParams) -> Result<Option<bool>> {
    match params.get("orderComplete") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(*flag)),
        Some(_) => Err(InputError::new("orderComplete must be a boolean").into()),
    }
}

/// Resolves the optional `usedToken` parameter to its silo token index.
pub(crate) fn used_token_param(
    settings: &BlueprintSettings,
    params: &BlueprintParams,
) -> Result<Option<u8>> {
    let token = match params.get("usedToken") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(token)) => token,
        Some(_) => return Err(InputError::new("usedToken must be a token address").into()),
    };
    token
        .parse::<alloy_primitives::Address>()
        .ok()
        .and_then(|address| settings.token_index(&address))
        .map(Some)
        .ok_or_else(|| {
            InputError::new("usedToken must correspond to a valid silo token address").into()
        })
}

/// Side tables owned by one blueprint.
pub struct BlueprintTables<O, E> {
    pub orders: Table<O>,
    pub executions: Table<E>,
}

impl<O: Record, E: Record> BlueprintTables<O, E> {
    pub const fn new(orders: &'static str, executions: &'static str) -> Self {
        Self {
            orders: Table::new(orders),
            executions: Table::new(executions),
        }
    }

    pub async fn get_order(&self, tx: &dyn Transaction, blueprint_hash: &B256) -> Result<O> {
        self.orders
            .get(tx, &blueprint_hash.to_string())
            .await?
            .ok_or_else(|| anyhow!("{} order {blueprint_hash} not found", self.orders.name()))
    }

    pub async fn get_orders(&self, tx: &dyn Transaction, filter: &Filter) -> Result<Vec<O>> {
        self.orders.find_all(tx, filter).await
    }

    pub async fn update_orders(&self, tx: &dyn Transaction, rows: &[O]) -> Result<()> {
        self.orders.upsert(tx, rows).await
    }

    pub async fn get_executions(&self, tx: &dyn Transaction, filter: &Filter) -> Result<Vec<E>> {
        self.executions.find_all(tx, filter).await
    }

    pub async fn update_executions(&self, tx: &dyn Transaction, rows: &[E]) -> Result<()> {
        self.executions.upsert(tx, rows).await
    }

    /// Side rows of the given orders that also satisfy `extra`, keyed by blueprint hash.
    pub async fn order_data(
        &self,
        tx: &dyn Transaction,
        hashes: &[B256],
        extra: Filter,
    ) -> Result<Vec<(String, Value)>> {
        let filter = Filter::new().is_in("blueprint_hash", hashes).and(extra);
        let rows = self.get_orders(tx, &filter).await?;
        rows.iter()
            .map(|row| Ok((row.key(), serde_json::to_value(row)?)))
            .collect()
    }

    /// Side rows of the given executions that also satisfy `extra`, keyed by execution key.
    pub async fn execution_data(
        &self,
        tx: &dyn Transaction,
        keys: &[String],
        extra: Filter,
    ) -> Result<Vec<(String, Value)>> {
        let filter = Filter::new().is_in("id", keys).and(extra);
        let rows = self.get_executions(tx, &filter).await?;
        rows.iter()
            .map(|row| Ok((row.key(), serde_json::to_value(row)?)))
            .collect()
    }
}

/// Capability interface every known order type implements.
pub trait Blueprint: Send + Sync {
    type Call: fmt::Debug + Send + Sync;
    type OrderData: Record + Clone + 'static;
    type ExecutionData: Record + Clone + 'static;

    const ORDER_TYPE: OrderType;
    const TABLES: BlueprintTables<Self::OrderData, Self::ExecutionData>;

    /// Interprets a blueprint payload as this type's call. Never fails on foreign input.
    fn decode(&self, data: &[u8]) -> Option<Self::Call>;

    /// Persists side data and returns the offered tip when `order` is of this type.
    fn try_claim<'a>(
        &'a self,
        tx: &'a dyn Transaction,
        order: &'a Order,
    ) -> BoxFuture<'a, Result<Option<U256>>>;

    /// Updates side data after an execution and returns the tip paid in the stable unit.
    fn on_executed<'a>(
        &'a self,
        tx: &'a dyn Transaction,
        order: &'a Order,
        execution: &'a Execution,
        inner_events: &'a [&'a Event],
    ) -> BoxFuture<'a, Result<Option<U256>>>;

    /// Zeroes the speculative funding fields of a cancelled order.
    fn on_cancelled<'a>(
        &'a self,
        tx: &'a dyn Transaction,
        order: &'a Order,
    ) -> BoxFuture<'a, Result<()>>;

    fn periodic_update<'a>(
        &'a self,
        tx: &'a dyn Transaction,
        from_block: u64,
        to_block: u64,
    ) -> BoxFuture<'a, Result<PeriodicReport>>;

    fn validate_order_params(&self, params: &BlueprintParams) -> Result<()>;

    fn order_query_filter(&self, params: &BlueprintParams) -> Filter;

    fn validate_execution_params(&self, params: &BlueprintParams) -> Result<()>;

    fn execution_query_filter(&self, params: &BlueprintParams) -> Filter;
}
