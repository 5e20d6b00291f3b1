//! Resumable indexer for Tractor order blueprints.
//!
//! Each cycle reads protocol events for the next confirmed block range,
//! reflects publications, executions and cancellations into the store,
//! refreshes the funding simulation of every known blueprint and advances the
//! watermark, all in one transaction.

pub mod abi;
pub mod blueprints;
pub mod chain;
pub mod events;
pub mod model;
pub mod processor;
pub mod query;
pub mod rpc;
pub mod runtime;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use blueprints::{BlueprintDeps, BlueprintRegistry, KnownBlueprint, PeriodicReport};
pub use chain::{ChainState, PriceFeed, SimulationError};
pub use events::{Event, EventArgs, EventKind, EventSource, RawLog};
pub use model::{Execution, Order, OrderType, TractorMeta};
pub use processor::orchestrator::{Orchestrator, OrchestratorParams};
pub use query::{ExecutionRequest, OrderRequest, OrderTypeFilter, TimeRange, TractorQueries};
pub use rpc::circuit_breaker::{
    BreakerSettings, CircuitBreakerSnapshot, CircuitState, RpcCircuitBreaker,
};
pub use rpc::{AsyncRpcClient, RpcError, RpcEventSource};
pub use runtime::config::{
    BlueprintSettings, IndexerConfig, IndexerConfigBuilder, IndexerConfigParams,
};
pub use runtime::error::{CycleError, CycleStage, InputError};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use store::{MemoryStore, PersistenceGateway, Transaction};
