use alloy_primitives::{Address, U256};
use anyhow::Result;
use serde_json::json;
use tractor_indexer::query::{ExecutionStats, OrderInfo};
use tractor_indexer::{
    ExecutionRequest, InputError, OrderRequest, OrderType, OrderTypeFilter, TimeRange,
};

use crate::support::{
    harness::{Harness, START_BLOCK},
    helpers::{
        cancel, hash, init_tracing, publish, reward, sow, sow_payload, timestamp_of, tractor,
        PUBLISHER,
    },
};

/// Two sow orders and one unknown order; the first sow order completes.
async fn indexed() -> Result<Harness> {
    let first_tx = hash(0xe1);
    let second_tx = hash(0xe2);
    let events = vec![
        publish(101, 0, hash(0x01), sow_payload(500, 500, 1_000_000)),
        publish(102, 0, hash(0x02), sow_payload(10_000, 1_000, 0)),
        publish(103, 0, hash(0x03), vec![0x01, 0x02].into()),
        tractor(105, 0, first_tx, hash(0x01), 0),
        sow(105, 1, first_tx, 500, 900_000),
        reward(105, 2, first_tx, 1_000_000),
        tractor(107, 0, second_tx, hash(0x02), 0),
        sow(107, 1, second_tx, 250, 950_000),
        tractor(108, 0, hash(0xe3), hash(0x03), 0),
        cancel(109, 0, hash(0x03)),
    ];
    let harness = Harness::new(110, events, 50)?;
    harness.orchestrator.initialize(START_BLOCK).await?;
    harness.catch_up().await?;
    Ok(harness)
}

fn params(value: serde_json::Value) -> Option<serde_json::Map<String, serde_json::Value>> {
    value.as_object().cloned()
}

#[tokio::test]
async fn orders_are_newest_first_with_side_data_and_stats() -> Result<()> {
    init_tracing();
    let harness = indexed().await?;
    let result = harness.queries().get_orders(OrderRequest::default()).await?;

    assert_eq!(result.last_updated, Some(110));
    assert_eq!(result.total_records, 3);
    let hashes: Vec<_> = result.orders.iter().map(|view| view.order.blueprint_hash).collect();
    assert_eq!(hashes, vec![hash(0x03), hash(0x02), hash(0x01)]);

    let unknown = &result.orders[0];
    assert_eq!(unknown.blueprint_data, None);
    assert!(unknown.order.cancelled);

    let completed = &result.orders[2];
    let data = completed.blueprint_data.as_ref().expect("sow data");
    assert_eq!(data["order_complete"], json!(true));
    assert_eq!(
        completed.execution_stats,
        ExecutionStats {
            count: 1,
            last_executed_timestamp: Some(timestamp_of(105)),
        }
    );
    Ok(())
}

#[tokio::test]
async fn order_type_filters_split_known_and_unknown() -> Result<()> {
    init_tracing();
    let harness = indexed().await?;
    let queries = harness.queries();

    let known = queries
        .get_orders(OrderRequest {
            order_type: Some(OrderTypeFilter::Known),
            ..OrderRequest::default()
        })
        .await?;
    assert_eq!(known.orders.len(), 2);
    assert!(known
        .orders
        .iter()
        .all(|view| view.order.order_type == Some(OrderType::SowV0)));

    let unknown = queries
        .get_orders(OrderRequest {
            order_type: Some(OrderTypeFilter::Unknown),
            ..OrderRequest::default()
        })
        .await?;
    assert_eq!(unknown.orders.len(), 1);
    assert_eq!(unknown.orders[0].order.blueprint_hash, hash(0x03));

    let convert = queries
        .get_orders(OrderRequest {
            order_type: Some(OrderTypeFilter::Exact(OrderType::ConvertUpV0)),
            ..OrderRequest::default()
        })
        .await?;
    assert!(convert.orders.is_empty());
    assert_eq!(convert.total_records, 0);
    Ok(())
}

#[tokio::test]
async fn blueprint_params_narrow_sow_orders() -> Result<()> {
    init_tracing();
    let harness = indexed().await?;

    let open = harness
        .queries()
        .get_orders(OrderRequest {
            order_type: Some(OrderTypeFilter::Exact(OrderType::SowV0)),
            blueprint_params: params(json!({ "orderComplete": false })),
            ..OrderRequest::default()
        })
        .await?;
    let hashes: Vec<_> = open.orders.iter().map(|view| view.order.blueprint_hash).collect();
    assert_eq!(hashes, vec![hash(0x02)]);
    assert_eq!(open.total_records, 2, "counted before blueprint filters");
    Ok(())
}

#[tokio::test]
async fn generic_order_filters_apply() -> Result<()> {
    init_tracing();
    let harness = indexed().await?;
    let queries = harness.queries();

    let published = queries
        .get_orders(OrderRequest {
            published_between: Some(TimeRange(timestamp_of(102), timestamp_of(103))),
            ..OrderRequest::default()
        })
        .await?;
    assert_eq!(published.orders.len(), 2);

    let live = queries
        .get_orders(OrderRequest {
            cancelled: Some(false),
            publisher: Some(PUBLISHER),
            limit: Some(1),
            ..OrderRequest::default()
        })
        .await?;
    assert_eq!(live.total_records, 2);
    assert_eq!(live.orders.len(), 1);
    assert_eq!(live.orders[0].order.blueprint_hash, hash(0x02));

    let stranger = queries
        .get_orders(OrderRequest {
            publisher: Some(Address::repeat_byte(0x99)),
            ..OrderRequest::default()
        })
        .await?;
    assert!(stranger.orders.is_empty());
    Ok(())
}

#[tokio::test]
async fn invalid_order_requests_are_input_errors() -> Result<()> {
    init_tracing();
    let harness = indexed().await?;
    let queries = harness.queries();

    let err = queries
        .get_orders(OrderRequest {
            published_between: Some(TimeRange(200, 100)),
            ..OrderRequest::default()
        })
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<InputError>().is_some(), "{err:#}");

    let err = queries
        .get_orders(OrderRequest {
            order_type: Some(OrderTypeFilter::Exact(OrderType::SowV0)),
            blueprint_params: params(json!({ "orderComplete": "yes" })),
            ..OrderRequest::default()
        })
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<InputError>().is_some(), "{err:#}");
    Ok(())
}

#[tokio::test]
async fn executions_carry_owner_info_and_side_data() -> Result<()> {
    init_tracing();
    let harness = indexed().await?;
    let result = harness.queries().get_executions(ExecutionRequest::default()).await?;

    assert_eq!(result.last_updated, Some(110));
    assert_eq!(result.total_records, 3);
    let blocks: Vec<u64> = result
        .executions
        .iter()
        .map(|view| view.execution.executed_block)
        .collect();
    assert_eq!(blocks, vec![108, 107, 105]);

    let first = &result.executions[2];
    assert_eq!(
        first.order_info,
        Some(OrderInfo {
            order_type: Some(OrderType::SowV0),
            publisher: PUBLISHER,
        })
    );
    assert_eq!(first.execution.tip_paid, Some(U256::from(1_000_000u64)));
    let data = first.blueprint_data.as_ref().expect("sow execution data");
    assert_eq!(data["id"], json!(first.execution.blueprint_hash.to_string() + ":0"));

    let unknown = &result.executions[0];
    assert_eq!(unknown.order_info.and_then(|info| info.order_type), None);
    assert_eq!(unknown.blueprint_data, None);
    Ok(())
}

#[tokio::test]
async fn execution_filters_resolve_owning_orders() -> Result<()> {
    init_tracing();
    let harness = indexed().await?;
    let queries = harness.queries();

    let sown = queries
        .get_executions(ExecutionRequest {
            order_type: Some(OrderTypeFilter::Exact(OrderType::SowV0)),
            ..ExecutionRequest::default()
        })
        .await?;
    assert_eq!(sown.executions.len(), 2);

    let by_hash = queries
        .get_executions(ExecutionRequest {
            blueprint_hash: Some(hash(0x02)),
            nonce: Some(U256::ZERO),
            ..ExecutionRequest::default()
        })
        .await?;
    assert_eq!(by_hash.executions.len(), 1);
    assert_eq!(by_hash.executions[0].execution.executed_block, 107);

    let stranger = queries
        .get_executions(ExecutionRequest {
            publisher: Some(Address::repeat_byte(0x99)),
            ..ExecutionRequest::default()
        })
        .await?;
    assert!(stranger.executions.is_empty());

    let err = queries
        .get_executions(ExecutionRequest {
            blueprint_params: params(json!({
                "usedToken": "0x0000000000000000000000000000000000000001"
            })),
            ..ExecutionRequest::default()
        })
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<InputError>().is_some(), "{err:#}");
    Ok(())
}
