//! Node-health circuit breaker shared by every call an
//! [`AsyncRpcClient`](crate::rpc::AsyncRpcClient) makes against one node.
//!
//! The breaker judges the node, not the request: an attempt the node answered
//! (even with a body too large for our limits) proves it alive, while
//! timeouts and transport or server failures count towards tripping.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_FAILURE_THRESHOLD: usize = 5;
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_HALF_OPEN_PROBES: usize = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// How the node handled one attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Answered,
    /// The node replied but the body exceeded the client's limits.
    Oversized,
    TimedOut,
    Failed,
}

impl CallOutcome {
    pub fn node_responded(self) -> bool {
        matches!(self, CallOutcome::Answered | CallOutcome::Oversized)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct BreakerSettings {
    /// Consecutive unhealthy outcomes that open the circuit.
    pub failure_threshold: usize,
    pub cooldown: Duration,
    /// Attempts let through while half-open.
    pub half_open_probes: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            half_open_probes: DEFAULT_HALF_OPEN_PROBES,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub opened_at: Option<Instant>,
    /// Number of times the circuit has opened.
    pub trips: u64,
    pub last_failed_method: Option<&'static str>,
}

/// Refusal to admit an attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CircuitOpen {
    pub method: &'static str,
    /// Time left before a half-open probe is allowed; zero while probes are in flight.
    pub retry_in: Duration,
}

impl std::fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rpc circuit breaker is open; {} refused for {}ms",
            self.method,
            self.retry_in.as_millis()
        )
    }
}

impl std::error::Error for CircuitOpen {}

/// Ticket for one admitted attempt, handed back through [`RpcCircuitBreaker::settle`].
#[derive(Debug)]
#[must_use = "an admitted attempt must be settled"]
pub struct Admission {
    method: &'static str,
    state: CircuitState,
}

impl Admission {
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn method(&self) -> &'static str {
        self.method
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    probes_in_flight: usize,
    trips: u64,
    last_failed_method: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct RpcCircuitBreaker {
    inner: Arc<Mutex<Inner>>,
    settings: BreakerSettings,
}

impl Default for RpcCircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

impl RpcCircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        let settings = BreakerSettings {
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: if settings.cooldown.is_zero() {
                Duration::from_secs(1)
            } else {
                settings.cooldown
            },
            half_open_probes: settings.half_open_probes.max(1),
        };
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
                trips: 0,
                last_failed_method: None,
            })),
            settings,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            trips: inner.trips,
            last_failed_method: inner.last_failed_method,
        }
    }

    /// Admits an attempt at `method`, moving an expired open circuit to half-open.
    pub fn admit(&self, method: &'static str) -> Result<Admission, CircuitOpen> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
            if elapsed < self.settings.cooldown {
                return Err(CircuitOpen {
                    method,
                    retry_in: self.settings.cooldown - elapsed,
                });
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
            inner.probes_in_flight = 0;
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.probes_in_flight >= self.settings.half_open_probes {
                return Err(CircuitOpen {
                    method,
                    retry_in: Duration::ZERO,
                });
            }
            inner.probes_in_flight += 1;
        }

        Ok(Admission {
            method,
            state: inner.state,
        })
    }

    /// Records how the node handled an admitted attempt.
    pub fn settle(&self, admission: Admission, outcome: CallOutcome) {
        let mut inner = self.lock();
        if admission.state == CircuitState::HalfOpen && inner.probes_in_flight > 0 {
            inner.probes_in_flight -= 1;
        }

        if outcome.node_responded() {
            inner.consecutive_failures = 0;
            if inner.state == CircuitState::HalfOpen {
                inner.opened_at = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failed_method = Some(admission.method);
        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.settings.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            inner.opened_at = Some(Instant::now());
            inner.probes_in_flight = 0;
            inner.trips += 1;
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        if inner.state != next {
            tracing::warn!(
                previous = ?inner.state,
                next = ?next,
                consecutive_failures = inner.consecutive_failures,
                last_failed_method = inner.last_failed_method,
                "rpc circuit breaker state changed"
            );
            inner.state = next;
        }
    }
}
