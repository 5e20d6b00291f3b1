//! Read-side search over indexed orders and executions.
//!
//! Every request reads inside one transaction together with the watermark, so
//! results always describe a fully committed cycle. Known blueprints attach
//! their side rows; rows that fail a blueprint's type-specific filter are
//! dropped from the page.

use crate::blueprints::{BlueprintParams, BlueprintRegistry, KnownBlueprint};
use crate::model::{Execution, Order, OrderType, EXECUTIONS, META, ORDERS, TRACTOR_META_KEY};
use crate::runtime::error::InputError;
use crate::store::{Filter, Page, PersistenceGateway, Record, SortOrder, Transaction};
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_LIMIT: usize = 100;

/// Which orders a request is restricted to by classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OrderTypeFilter {
    Known,
    Unknown,
    Exact(OrderType),
}

impl OrderTypeFilter {
    fn filter(&self) -> Filter {
        match self {
            OrderTypeFilter::Known => Filter::new().not_null("order_type"),
            OrderTypeFilter::Unknown => Filter::new().is_null("order_type"),
            OrderTypeFilter::Exact(ty) => Filter::new().eq("order_type", ty),
        }
    }

    fn admits(&self, order_type: Option<OrderType>) -> bool {
        match self {
            OrderTypeFilter::Known => order_type.is_some(),
            OrderTypeFilter::Unknown => order_type.is_none(),
            OrderTypeFilter::Exact(ty) => order_type == Some(*ty),
        }
    }
}

impl FromStr for OrderTypeFilter {
    type Err = InputError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "KNOWN" => Ok(OrderTypeFilter::Known),
            "UNKNOWN" => Ok(OrderTypeFilter::Unknown),
            other => other
                .parse::<OrderType>()
                .map(OrderTypeFilter::Exact)
                .map_err(|_| InputError::new(format!("invalid orderType {other}"))),
        }
    }
}

impl TryFrom<String> for OrderTypeFilter {
    type Error = InputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OrderTypeFilter> for String {
    fn from(filter: OrderTypeFilter) -> Self {
        filter.to_string()
    }
}

impl fmt::Display for OrderTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderTypeFilter::Known => f.write_str("KNOWN"),
            OrderTypeFilter::Unknown => f.write_str("UNKNOWN"),
            OrderTypeFilter::Exact(ty) => fmt::Display::fmt(ty, f),
        }
    }
}

/// Inclusive `[start, end]` window of unix timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange(pub u64, pub u64);

impl TimeRange {
    pub fn start(&self) -> u64 {
        self.0
    }

    pub fn end(&self) -> u64 {
        self.1
    }

    fn validate(&self, name: &str) -> Result<(), InputError> {
        if self.end() <= self.start() {
            return Err(InputError::new(format!(
                "{name} must end after it starts (got {}..{})",
                self.start(),
                self.end()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderRequest {
    pub order_type: Option<OrderTypeFilter>,
    pub blueprint_hash: Option<B256>,
    pub publisher: Option<Address>,
    pub published_between: Option<TimeRange>,
    /// Orders whose validity window overlaps this range.
    pub valid_between: Option<TimeRange>,
    pub cancelled: Option<bool>,
    pub blueprint_params: Option<BlueprintParams>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionRequest {
    pub order_type: Option<OrderTypeFilter>,
    pub blueprint_hash: Option<B256>,
    pub nonce: Option<U256>,
    pub publisher: Option<Address>,
    pub operator: Option<Address>,
    pub executed_between: Option<TimeRange>,
    pub blueprint_params: Option<BlueprintParams>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub count: usize,
    pub last_executed_timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    #[serde(flatten)]
    pub order: Order,
    pub blueprint_data: Option<Value>,
    pub execution_stats: ExecutionStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrdersResult {
    pub last_updated: Option<u64>,
    pub orders: Vec<OrderView>,
    /// Rows matching the generic filters, before paging and blueprint filters.
    pub total_records: usize,
}

/// Fields of the owning order repeated on each execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInfo {
    pub order_type: Option<OrderType>,
    pub publisher: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionView {
    #[serde(flatten)]
    pub execution: Execution,
    pub order_info: Option<OrderInfo>,
    pub blueprint_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionsResult {
    pub last_updated: Option<u64>,
    pub executions: Vec<ExecutionView>,
    pub total_records: usize,
}

#[derive(Clone)]
pub struct TractorQueries {
    gateway: Arc<dyn PersistenceGateway>,
    registry: Arc<BlueprintRegistry>,
}

impl TractorQueries {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, registry: Arc<BlueprintRegistry>) -> Self {
        Self { gateway, registry }
    }

    pub async fn get_orders(&self, request: OrderRequest) -> Result<OrdersResult> {
        validate_orders(&self.registry, &request)?;
        let tx = self.gateway.begin().await.context("failed to open read transaction")?;
        let result = self.orders_in(tx.as_ref(), &request).await;
        tx.rollback().await?;
        result
    }

    pub async fn get_executions(&self, request: ExecutionRequest) -> Result<ExecutionsResult> {
        validate_executions(&self.registry, &request)?;
        let tx = self.gateway.begin().await.context("failed to open read transaction")?;
        let result = self.executions_in(tx.as_ref(), &request).await;
        tx.rollback().await?;
        result
    }

    async fn orders_in(&self, tx: &dyn Transaction, request: &OrderRequest) -> Result<OrdersResult> {
        let last_updated = last_updated(tx).await?;
        let filter = order_filter(request);
        let page = page_of(request.limit, request.skip).sorted_by("published_block", SortOrder::Desc);
        let found = ORDERS
            .find(tx, &filter, &page)
            .await
            .context("failed to search orders")?;

        let params = request.blueprint_params.clone().unwrap_or_default();
        let mut side_data = HashMap::new();
        let mut dropped = Vec::new();
        for (ty, orders) in group_by_type(&found.rows, |order| order.order_type) {
            let blueprint = self.registry.get(ty);
            let hashes: Vec<B256> = orders.iter().map(|order| order.blueprint_hash).collect();
            let rows = blueprint
                .order_data(tx, &hashes, blueprint.order_query_filter(&params))
                .await
                .with_context(|| format!("failed to load {ty} order data"))?;
            let rows: HashMap<String, Value> = rows.into_iter().collect();
            for order in orders {
                let key = order.blueprint_hash.to_string();
                match rows.get(&key) {
                    Some(data) => {
                        side_data.insert(key, data.clone());
                    }
                    None => dropped.push(key),
                }
            }
        }

        let orders: Vec<Order> = found
            .rows
            .into_iter()
            .filter(|order| !dropped.contains(&order.blueprint_hash.to_string()))
            .collect();
        let hashes: Vec<B256> = orders.iter().map(|order| order.blueprint_hash).collect();
        let stats = execution_stats(tx, &hashes).await?;

        let orders = orders
            .into_iter()
            .map(|order| {
                let key = order.blueprint_hash;
                OrderView {
                    blueprint_data: side_data.remove(&key.to_string()),
                    execution_stats: stats.get(&key).copied().unwrap_or_default(),
                    order,
                }
            })
            .collect();

        Ok(OrdersResult {
            last_updated,
            orders,
            total_records: found.total,
        })
    }

    async fn executions_in(
        &self,
        tx: &dyn Transaction,
        request: &ExecutionRequest,
    ) -> Result<ExecutionsResult> {
        let last_updated = last_updated(tx).await?;

        let mut filter = execution_filter(request);
        if request.order_type.is_some() || request.publisher.is_some() {
            let mut owners = Filter::new();
            if let Some(order_type) = &request.order_type {
                owners = owners.and(order_type.filter());
            }
            if let Some(publisher) = &request.publisher {
                owners = owners.eq("publisher", publisher);
            }
            let hashes: Vec<B256> = ORDERS
                .find_all(tx, &owners)
                .await
                .context("failed to resolve owning orders")?
                .into_iter()
                .map(|order| order.blueprint_hash)
                .collect();
            filter = filter.is_in("blueprint_hash", hashes);
        }

        let page = page_of(request.limit, request.skip).sorted_by("executed_block", SortOrder::Desc);
        let found = EXECUTIONS
            .find(tx, &filter, &page)
            .await
            .context("failed to search executions")?;

        let owner_hashes: Vec<B256> = found
            .rows
            .iter()
            .map(|execution| execution.blueprint_hash)
            .collect();
        let owners: HashMap<B256, OrderInfo> = ORDERS
            .find_all(tx, &Filter::new().is_in("blueprint_hash", &owner_hashes))
            .await
            .context("failed to load owning orders")?
            .into_iter()
            .map(|order| {
                (
                    order.blueprint_hash,
                    OrderInfo {
                        order_type: order.order_type,
                        publisher: order.publisher,
                    },
                )
            })
            .collect();

        let order_type_of = |execution: &Execution| {
            owners
                .get(&execution.blueprint_hash)
                .and_then(|info| info.order_type)
        };

        let params = request.blueprint_params.clone().unwrap_or_default();
        let mut side_data = HashMap::new();
        let mut dropped = Vec::new();
        for (ty, executions) in group_by_type(&found.rows, order_type_of) {
            let blueprint = self.registry.get(ty);
            let keys: Vec<String> = executions.iter().map(|execution| execution.key()).collect();
            let rows = blueprint
                .execution_data(tx, &keys, blueprint.execution_query_filter(&params))
                .await
                .with_context(|| format!("failed to load {ty} execution data"))?;
            let rows: HashMap<String, Value> = rows.into_iter().collect();
            for key in keys {
                match rows.get(&key) {
                    Some(data) => {
                        side_data.insert(key, data.clone());
                    }
                    None => dropped.push(key),
                }
            }
        }

        let executions = found
            .rows
            .into_iter()
            .filter(|execution| !dropped.contains(&execution.key()))
            .map(|execution| {
                let key = execution.key();
                ExecutionView {
                    order_info: owners.get(&execution.blueprint_hash).copied(),
                    blueprint_data: side_data.remove(&key),
                    execution,
                }
            })
            .collect();

        Ok(ExecutionsResult {
            last_updated,
            executions,
            total_records: found.total,
        })
    }
}

fn validate_orders(registry: &BlueprintRegistry, request: &OrderRequest) -> Result<()> {
    if let Some(range) = &request.published_between {
        range.validate("publishedBetween")?;
    }
    if let Some(range) = &request.valid_between {
        range.validate("validBetween")?;
    }
    if let Some(params) = &request.blueprint_params {
        for blueprint in blueprints_for(registry, request.order_type) {
            blueprint.validate_order_params(params)?;
        }
    }
    Ok(())
}

fn validate_executions(registry: &BlueprintRegistry, request: &ExecutionRequest) -> Result<()> {
    if let Some(range) = &request.executed_between {
        range.validate("executedBetween")?;
    }
    if let Some(params) = &request.blueprint_params {
        for blueprint in blueprints_for(registry, request.order_type) {
            blueprint.validate_execution_params(params)?;
        }
    }
    Ok(())
}

/// Blueprints whose rows a request with this type filter can return.
fn blueprints_for(
    registry: &BlueprintRegistry,
    order_type: Option<OrderTypeFilter>,
) -> Vec<&KnownBlueprint> {
    registry
        .iter()
        .filter(|blueprint| {
            order_type.map_or(true, |filter| filter.admits(Some(blueprint.order_type())))
        })
        .collect()
}

fn order_filter(request: &OrderRequest) -> Filter {
    let mut filter = Filter::new();
    if let Some(order_type) = &request.order_type {
        filter = filter.and(order_type.filter());
    }
    if let Some(hash) = &request.blueprint_hash {
        filter = filter.eq("blueprint_hash", hash);
    }
    if let Some(publisher) = &request.publisher {
        filter = filter.eq("publisher", publisher);
    }
    if let Some(range) = &request.published_between {
        filter = filter.between("published_timestamp", range.start(), range.end());
    }
    if let Some(range) = &request.valid_between {
        filter = filter
            .lte("start_time", range.end())
            .gte("end_time", range.start());
    }
    if let Some(cancelled) = request.cancelled {
        filter = filter.eq("cancelled", cancelled);
    }
    filter
}

fn execution_filter(request: &ExecutionRequest) -> Filter {
    let mut filter = Filter::new();
    if let Some(hash) = &request.blueprint_hash {
        filter = filter.eq("blueprint_hash", hash);
    }
    if let Some(nonce) = &request.nonce {
        filter = filter.eq("nonce", nonce);
    }
    if let Some(operator) = &request.operator {
        filter = filter.eq("operator", operator);
    }
    if let Some(range) = &request.executed_between {
        filter = filter.between("executed_timestamp", range.start(), range.end());
    }
    filter
}

fn page_of(limit: Option<usize>, skip: Option<usize>) -> Page {
    Page::limit(limit.unwrap_or(DEFAULT_LIMIT)).with_offset(skip.unwrap_or_default())
}

/// Groups rows of known type, preserving their order within each type.
fn group_by_type<T>(
    rows: &[T],
    type_of: impl Fn(&T) -> Option<OrderType>,
) -> BTreeMap<OrderType, Vec<&T>> {
    let mut groups: BTreeMap<OrderType, Vec<&T>> = BTreeMap::new();
    for row in rows {
        if let Some(ty) = type_of(row) {
            groups.entry(ty).or_default().push(row);
        }
    }
    groups
}

async fn last_updated(tx: &dyn Transaction) -> Result<Option<u64>> {
    Ok(META
        .get(tx, TRACTOR_META_KEY)
        .await
        .context("failed to read tractor watermark")?
        .and_then(|meta| meta.last_update))
}

async fn execution_stats(
    tx: &dyn Transaction,
    hashes: &[B256],
) -> Result<HashMap<B256, ExecutionStats>> {
    if hashes.is_empty() {
        return Ok(HashMap::new());
    }
    let executions = EXECUTIONS
        .find_all(tx, &Filter::new().is_in("blueprint_hash", hashes))
        .await
        .context("failed to load execution stats")?;

    let mut stats: HashMap<B256, ExecutionStats> = HashMap::new();
    for execution in executions {
        let entry = stats.entry(execution.blueprint_hash).or_default();
        entry.count += 1;
        entry.last_executed_timestamp = entry
            .last_executed_timestamp
            .max(Some(execution.executed_timestamp));
    }
    Ok(stats)
}
