//! Node access over JSON-RPC: the retrying client with its circuit breaker,
//! metrics and options, plus the log-backed event source.

pub mod circuit_breaker;
pub mod client;
pub mod event_source;
pub mod helpers;
pub mod metrics;
pub mod options;
pub mod retry;

pub use circuit_breaker::{
    BreakerSettings, CallOutcome, CircuitBreakerSnapshot, CircuitOpen, CircuitState,
    RpcCircuitBreaker,
};
pub use client::{AsyncRpcClient, RpcError};
pub use event_source::RpcEventSource;
pub use helpers::{parse_quantity, to_quantity, RpcBlockHeader, RpcLog};
pub use metrics::RpcMetricsSnapshot;
pub use options::RpcClientOptions;
