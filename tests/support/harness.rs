use std::sync::Arc;

use alloy_primitives::U256;
use anyhow::Result;
use serde::de::DeserializeOwned;
use tractor_indexer::model::{TractorMeta, META};
use tractor_indexer::{
    Event, IndexerConfig, MemoryStore, Orchestrator, OrchestratorParams, PersistenceGateway,
    Telemetry, TractorQueries,
};

use super::fakes::{FixedPrice, ScriptedSource, StaticChain};
use super::helpers::{config, PUBLISHER};

pub const START_BLOCK: u64 = 100;
pub const PUBLISHER_POOL: u64 = 1_500;

/// An orchestrator over an in-memory store and a scripted chain.
pub struct Harness {
    pub store: MemoryStore,
    pub source: Arc<ScriptedSource>,
    pub telemetry: Arc<Telemetry>,
    pub config: IndexerConfig,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(head: u64, events: Vec<Event>, max_blocks: u64) -> Result<Self> {
        let config = config("http://127.0.0.1:8545", START_BLOCK, max_blocks)?;
        Ok(Self::with_config(config, head, events))
    }

    pub fn with_config(config: IndexerConfig, head: u64, events: Vec<Event>) -> Self {
        let store = MemoryStore::new();
        let source = Arc::new(ScriptedSource::new(head, events));
        let telemetry = Arc::new(Telemetry::default());
        let orchestrator = Orchestrator::new(
            &config,
            OrchestratorParams {
                gateway: Arc::new(store.clone()),
                source: source.clone(),
                chain: Arc::new(StaticChain::new().with_pool(PUBLISHER, PUBLISHER_POOL)),
                prices: Arc::new(FixedPrice(U256::from(1_000_000u64))),
                telemetry: telemetry.clone(),
            },
        );
        Self {
            store,
            source,
            telemetry,
            config,
            orchestrator,
        }
    }

    pub fn queries(&self) -> TractorQueries {
        TractorQueries::new(Arc::new(self.store.clone()), self.orchestrator.registry().clone())
    }

    /// Runs cycles until the orchestrator reports it caught up.
    pub async fn catch_up(&self) -> Result<usize> {
        let mut cycles = 1;
        while self.orchestrator.run_cycle().await? {
            cycles += 1;
        }
        Ok(cycles)
    }

    pub async fn watermark(&self) -> Option<u64> {
        self.row::<TractorMeta>(META.name(), "tractor")
            .await
            .and_then(|meta| meta.last_update)
    }

    /// Moves the committed watermark, as an operator rewinding the indexer would.
    pub async fn rewind_to(&self, block: u64) -> Result<()> {
        let tx = self.store.begin().await?;
        META.upsert(tx.as_ref(), &[TractorMeta { last_update: Some(block) }])
            .await?;
        tx.commit().await
    }

    pub async fn row<T: DeserializeOwned>(&self, table: &str, key: &str) -> Option<T> {
        self.store
            .committed_rows(table)
            .await
            .get(key)
            .cloned()
            .map(|value| serde_json::from_value(value).expect("stored row must decode"))
    }
}
