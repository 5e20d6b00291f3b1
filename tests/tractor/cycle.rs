use alloy_primitives::{Bytes, U256};
use anyhow::Result;
use tractor_indexer::blueprints::sow_v0::{SowExecutionData, SowOrderData};
use tractor_indexer::{CycleError, CycleStage, Execution, Event, Order, OrderType};

use crate::support::{
    fakes::{HARVESTABLE_INDEX, SEASON},
    harness::{Harness, PUBLISHER_POOL, START_BLOCK},
    helpers::{
        cancel, hash, init_tracing, publish, reward, sow, sow_payload, timestamp_of, tractor,
        PUBLISHER,
    },
};

const SOW_ORDERS: &str = "tractor_order_sow_v0";
const SOW_EXECUTIONS: &str = "tractor_execution_sow_v0";

/// A sow order published at 101, an unknown order at 102, one sow execution
/// at 105 and the unknown order cancelled at 110.
fn scripted_history() -> Vec<Event> {
    let sow_tx = hash(0xe1);
    vec![
        publish(101, 0, hash(0x01), sow_payload(10_000, 2_000, 1_000_000)),
        publish(102, 0, hash(0x02), Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])),
        tractor(105, 0, sow_tx, hash(0x01), 0),
        sow(105, 1, sow_tx, 500, 1_000_000),
        reward(105, 2, sow_tx, 2_000_000),
        cancel(110, 0, hash(0x02)),
    ]
}

async fn indexed_history() -> Result<Harness> {
    let harness = Harness::new(120, scripted_history(), 50)?;
    assert!(harness.orchestrator.initialize(START_BLOCK).await?);
    Ok(harness)
}

#[tokio::test]
async fn cycle_reflects_publications_executions_and_cancellations() -> Result<()> {
    init_tracing();
    let harness = indexed_history().await?;

    let more = harness.orchestrator.run_cycle().await?;
    assert!(!more, "a single cycle covers the whole history");
    assert_eq!(harness.watermark().await, Some(120));

    let sow_hash = hash(0x01).to_string();
    let order: Order = harness.row("tractor_order", &sow_hash).await.expect("sow order");
    assert_eq!(order.order_type, Some(OrderType::SowV0));
    assert_eq!(order.tip_amount, Some(U256::from(1_000_000u64)));
    assert_eq!(order.published_block, 101);
    assert_eq!(order.published_timestamp, timestamp_of(101));
    assert!(!order.cancelled);

    let unknown: Order = harness
        .row("tractor_order", &hash(0x02).to_string())
        .await
        .expect("unknown order");
    assert_eq!(unknown.order_type, None);
    assert_eq!(unknown.tip_amount, None);
    assert!(unknown.cancelled);

    let key = Execution::key_for(&hash(0x01), &U256::ZERO);
    let execution: Execution = harness.row("tractor_execution", &key).await.expect("execution");
    assert_eq!(execution.executed_block, 105);
    assert_eq!(execution.transaction_hash, hash(0xe1));
    assert_eq!(execution.tip_paid, Some(U256::from(2_000_000u64)));

    let side: SowOrderData = harness.row(SOW_ORDERS, &sow_hash).await.expect("sow order data");
    assert_eq!(side.pinto_sown_counter, U256::from(500u64));
    assert_eq!(side.last_executed_season, Some(SEASON));
    assert_eq!(side.last_executable_season, Some(SEASON));
    assert!(!side.order_complete);
    assert_eq!(side.amount_funded, U256::from(PUBLISHER_POOL));
    assert_eq!(side.cascade_amount_funded, U256::from(PUBLISHER_POOL));

    let sown: SowExecutionData = harness.row(SOW_EXECUTIONS, &key).await.expect("sow execution data");
    assert_eq!(sown.id, key);
    assert_eq!(sown.beans, U256::from(500u64));
    assert_eq!(
        sown.place_in_line,
        U256::from(1_000_000u64 - HARVESTABLE_INDEX)
    );

    let telemetry = harness.telemetry.snapshot();
    assert_eq!(telemetry.cycles_completed, 1);
    assert_eq!(telemetry.processed_blocks, 21);
    assert_eq!(telemetry.orders_published, 2);
    assert_eq!(telemetry.orders_classified, 1);
    assert_eq!(telemetry.executions_recorded, 1);
    assert_eq!(telemetry.cancellations, 1);
    Ok(())
}

#[tokio::test]
async fn repeated_executions_of_one_order_accumulate() -> Result<()> {
    init_tracing();
    let events = vec![
        publish(101, 0, hash(0x01), sow_payload(10_000, 2_000, 0)),
        tractor(105, 0, hash(0xe1), hash(0x01), 0),
        sow(105, 1, hash(0xe1), 100, 1_000_000),
        tractor(105, 2, hash(0xe2), hash(0x01), 1),
        sow(105, 3, hash(0xe2), 100, 1_000_100),
        tractor(106, 0, hash(0xe3), hash(0x01), 2),
        sow(106, 1, hash(0xe3), 50, 1_000_200),
    ];
    let harness = Harness::new(120, events, 50)?;
    harness.orchestrator.initialize(START_BLOCK).await?;
    harness.catch_up().await?;

    let side: SowOrderData = harness
        .row(SOW_ORDERS, &hash(0x01).to_string())
        .await
        .expect("sow order data");
    assert_eq!(side.pinto_sown_counter, U256::from(250u64));
    assert_eq!(side.last_executed_season, Some(SEASON));
    assert_eq!(harness.telemetry.snapshot().executions_recorded, 3);

    let second = Execution::key_for(&hash(0x01), &U256::from(1u8));
    let sown: SowExecutionData = harness
        .row(SOW_EXECUTIONS, &second)
        .await
        .expect("second sow execution");
    assert_eq!(sown.beans, U256::from(100u64));
    assert_eq!(sown.place_in_line, U256::from(1_000_100u64 - HARVESTABLE_INDEX));
    Ok(())
}

#[tokio::test]
async fn catch_up_advances_in_bounded_steps() -> Result<()> {
    init_tracing();
    let harness = Harness::new(120, scripted_history(), 10)?;
    harness.orchestrator.initialize(START_BLOCK).await?;

    assert!(harness.orchestrator.run_cycle().await?);
    assert_eq!(harness.watermark().await, Some(109));
    assert!(harness.orchestrator.run_cycle().await?);
    assert_eq!(harness.watermark().await, Some(119));
    assert!(!harness.orchestrator.run_cycle().await?);
    assert_eq!(harness.watermark().await, Some(120));

    // The cancellation at 110 landed in the second cycle.
    let unknown: Order = harness
        .row("tractor_order", &hash(0x02).to_string())
        .await
        .expect("unknown order");
    assert!(unknown.cancelled);
    assert_eq!(harness.telemetry.snapshot().cycles_completed, 3);
    Ok(())
}

#[tokio::test]
async fn caught_up_cycle_changes_nothing() -> Result<()> {
    init_tracing();
    let harness = indexed_history().await?;
    harness.catch_up().await?;
    let before = harness.store.snapshot().await;
    let fetches = harness.source.fetches();

    assert!(!harness.orchestrator.run_cycle().await?);

    assert_eq!(harness.store.snapshot().await, before);
    assert_eq!(harness.source.fetches(), fetches, "no range left to fetch");
    assert_eq!(harness.telemetry.snapshot().cycles_completed, 1);
    Ok(())
}

#[tokio::test]
async fn replaying_a_committed_range_is_idempotent() -> Result<()> {
    init_tracing();
    let harness = indexed_history().await?;
    harness.catch_up().await?;
    let before = harness.store.snapshot().await;

    harness.rewind_to(START_BLOCK - 1).await?;
    harness.catch_up().await?;

    let after = harness.store.snapshot().await;
    for table in ["tractor_order", "tractor_execution", SOW_ORDERS, SOW_EXECUTIONS] {
        assert_eq!(after.get(table), before.get(table), "{table} changed on replay");
    }
    assert_eq!(harness.watermark().await, Some(120));
    assert_eq!(harness.telemetry.snapshot().executions_recorded, 1);
    Ok(())
}

#[tokio::test]
async fn failed_stage_rolls_back_the_whole_cycle() -> Result<()> {
    init_tracing();
    let harness = indexed_history().await?;
    let before = harness.store.snapshot().await;
    harness.store.fail_writes_to("tractor_execution").await;

    let err = harness
        .orchestrator
        .run_cycle()
        .await
        .expect_err("execution writes are failing");
    let cycle = err.downcast_ref::<CycleError>().expect("cycle error");
    assert_eq!(cycle.stage(), CycleStage::Execute);

    assert_eq!(harness.store.snapshot().await, before, "publications must not leak");
    assert_eq!(harness.watermark().await, Some(START_BLOCK - 1));
    let telemetry = harness.telemetry.snapshot();
    assert_eq!(telemetry.cycles_failed, 1);
    assert_eq!(telemetry.orders_published, 0);

    harness.store.clear_failures().await;
    assert!(!harness.orchestrator.run_cycle().await?);
    assert_eq!(harness.watermark().await, Some(120));
    assert_eq!(harness.telemetry.snapshot().executions_recorded, 1);
    Ok(())
}

#[tokio::test]
async fn fetch_failure_is_reported_at_the_fetch_stage() -> Result<()> {
    init_tracing();
    let harness = indexed_history().await?;
    harness.source.fail_fetches(true);

    let err = harness.orchestrator.run_cycle().await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<CycleError>().map(CycleError::stage),
        Some(CycleStage::Fetch)
    );
    assert_eq!(harness.watermark().await, Some(START_BLOCK - 1));
    Ok(())
}

#[tokio::test]
async fn uninitialized_indexer_does_nothing() -> Result<()> {
    init_tracing();
    let harness = Harness::new(120, scripted_history(), 50)?;

    assert!(!harness.orchestrator.run_cycle().await?);
    assert!(harness.store.snapshot().await.is_empty());
    assert_eq!(harness.source.fetches(), 0);
    Ok(())
}

#[tokio::test]
async fn initialization_never_moves_the_watermark_back() -> Result<()> {
    init_tracing();
    let harness = indexed_history().await?;
    harness.catch_up().await?;

    assert!(!harness.orchestrator.initialize(START_BLOCK).await?);
    assert_eq!(harness.watermark().await, Some(120));
    Ok(())
}

#[tokio::test]
async fn head_behind_the_watermark_is_an_empty_range() -> Result<()> {
    init_tracing();
    let harness = indexed_history().await?;
    harness.source.set_head(START_BLOCK - 1);

    assert!(!harness.orchestrator.run_cycle().await?);
    assert_eq!(harness.source.fetches(), 0);
    assert_eq!(harness.watermark().await, Some(START_BLOCK - 1));

    harness.source.set_head(101);
    harness.source.push(publish(
        101,
        1,
        hash(0x03),
        sow_payload(4_000, 1_000, 0),
    ));
    assert!(!harness.orchestrator.run_cycle().await?);
    let order: Order = harness
        .row("tractor_order", &hash(0x03).to_string())
        .await
        .expect("second sow order");
    assert_eq!(order.order_type, Some(OrderType::SowV0));
    assert_eq!(order.tip_amount, Some(U256::ZERO));
    assert_eq!(order.publisher, PUBLISHER);
    Ok(())
}
