use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::{sleep, timeout, Instant};
use tractor_indexer::model::{TractorMeta, META};
use tractor_indexer::{MemoryStore, Runner};

use crate::support::{
    harness::{Harness, START_BLOCK},
    helpers::{hash, init_tracing, publish, sow_payload, wait_until},
};

async fn watermark(store: &MemoryStore) -> Option<u64> {
    store
        .committed_rows(META.name())
        .await
        .get("tractor")
        .cloned()
        .and_then(|value| serde_json::from_value::<TractorMeta>(value).ok())
        .and_then(|meta| meta.last_update)
}

async fn wait_for_watermark(store: &MemoryStore, target: u64, limit: Duration) -> Result<()> {
    let deadline = Instant::now() + limit;
    loop {
        if watermark(store).await >= Some(target) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!(
                "watermark stuck at {:?} while waiting for {target}",
                watermark(store).await
            );
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_follows_the_chain_until_cancelled() -> Result<()> {
    init_tracing();
    let Harness {
        store,
        source,
        telemetry,
        config,
        orchestrator,
    } = Harness::new(120, Vec::new(), 8)?;
    let runner = Arc::new(Runner::new(&config, orchestrator));
    let shutdown = runner.cancellation_token();

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run().await }
    });

    wait_for_watermark(&store, 120, Duration::from_secs(5)).await?;

    source.push(publish(125, 0, hash(0x01), sow_payload(1_000, 100, 5)));
    source.set_head(130);
    wait_for_watermark(&store, 130, Duration::from_secs(5)).await?;
    assert!(store
        .committed_rows("tractor_order")
        .await
        .contains_key(&hash(0x01).to_string()));

    shutdown.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .context("runner did not stop after cancellation")??
        .context("runner returned an error")?;

    let snapshot = telemetry.snapshot();
    // 100..=120 in three cycles of at most 8 blocks, then 121..=130 in two.
    assert_eq!(snapshot.cycles_completed, 5);
    assert_eq!(snapshot.processed_blocks, 130 - (START_BLOCK - 1));
    assert_eq!(snapshot.orders_classified, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_cycles_are_retried() -> Result<()> {
    init_tracing();
    let Harness {
        store,
        source,
        telemetry,
        config,
        orchestrator,
    } = Harness::new(120, Vec::new(), 50)?;
    source.fail_fetches(true);
    let runner = Arc::new(Runner::new(&config, orchestrator));
    let shutdown = runner.cancellation_token();

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run().await }
    });

    wait_until(Duration::from_secs(5), "repeated cycle failures", || {
        telemetry.snapshot().cycles_failed >= 2
    })
    .await?;
    assert_eq!(watermark(&store).await, Some(START_BLOCK - 1));

    source.fail_fetches(false);
    wait_for_watermark(&store, 120, Duration::from_secs(5)).await?;

    shutdown.cancel();
    timeout(Duration::from_secs(5), task).await???;
    Ok(())
}

#[tokio::test]
async fn cancelled_runner_only_seeds_the_watermark() -> Result<()> {
    init_tracing();
    let Harness {
        store,
        source,
        config,
        orchestrator,
        ..
    } = Harness::new(120, Vec::new(), 50)?;
    let runner = Runner::new(&config, orchestrator);
    runner.cancellation_token().cancel();

    timeout(Duration::from_secs(5), runner.run()).await??;

    assert_eq!(watermark(&store).await, Some(START_BLOCK - 1));
    assert_eq!(source.fetches(), 0);
    Ok(())
}
