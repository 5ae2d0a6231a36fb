//! Circuit breaker for unreliable external dependencies.
//!
//! | State     | Calls                         | Leaves when                              |
//! |-----------|-------------------------------|------------------------------------------|
//! | closed    | pass through                  | `failure_threshold` consecutive failures |
//! | open      | rejected without running      | `recovery_timeout` elapsed               |
//! | half_open | exactly one probe, rest reject| probe succeeds (closed) or fails (open)  |

mod registry;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::env_or;
use crate::contracts::{BreakerError, Clock, RegistrarError};
use crate::metrics::BreakerMetrics;

pub use registry::{CircuitBreakerRegistry, NOTIFICATIONS, OBJECT_STORAGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    /// Creates a BreakerConfig from environment variables.
    ///
    /// Environment variables:
    /// - `REGISTRAR_BREAKER_FAILURE_THRESHOLD` (default: 5)
    /// - `REGISTRAR_BREAKER_RECOVERY_SECS` (default: 60)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            failure_threshold: env_or(
                "REGISTRAR_BREAKER_FAILURE_THRESHOLD",
                default.failure_threshold,
            ),
            recovery_timeout: Duration::from_secs(env_or(
                "REGISTRAR_BREAKER_RECOVERY_SECS",
                default.recovery_timeout.as_secs(),
            )),
        }
    }

    pub fn validate(&self) -> Result<(), RegistrarError> {
        if self.failure_threshold == 0 {
            return Err(RegistrarError::Config(
                "breaker failure threshold must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Monotonic time the circuit last opened.
    opened_at: Option<Duration>,
    opened_at_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    metrics: Arc<BreakerMetrics>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                opened_at_wall: None,
                probe_in_flight: false,
            }),
            metrics: Arc::new(BreakerMetrics::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &Arc<BreakerMetrics> {
        &self.metrics
    }

    /// Current state. An open circuit whose recovery timeout has elapsed
    /// reports `HalfOpen`: the next call will be let through as the probe.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.recovery_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let state = self.state();
        let inner = self.lock();
        CircuitBreakerState {
            name: self.name.clone(),
            state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at_wall,
        }
    }

    /// Runs `op` unless the circuit is open.
    ///
    /// A rejected call never invokes `op`. If the half-open probe's future
    /// is dropped before it resolves, the probe counts as failed.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire()?;
        match op().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(e) => {
                permit.fail();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Forces the circuit closed (manual recovery).
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.probe_in_flight = false;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State is plain data; a panic elsewhere cannot leave it half-written.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recovery_elapsed(&self, inner: &Inner) -> bool {
        let now = self.clock.monotonic();
        inner
            .opened_at
            .map_or(true, |at| now.saturating_sub(at) >= self.config.recovery_timeout)
    }

    fn acquire<E>(&self) -> Result<Permit<'_>, BreakerError<E>> {
        let mut inner = self.lock();
        let now = self.clock.monotonic();
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                if self.recovery_elapsed(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(breaker = %self.name, "Circuit half-open, sending probe");
                    Ok(Permit::new(self, true))
                } else {
                    let elapsed = inner.opened_at.map_or(Duration::ZERO, |at| now.saturating_sub(at));
                    drop(inner);
                    Err(self.reject(self.config.recovery_timeout.saturating_sub(elapsed)))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    drop(inner);
                    Err(self.reject(Duration::ZERO))
                } else {
                    inner.probe_in_flight = true;
                    Ok(Permit::new(self, true))
                }
            }
        }
    }

    fn reject<E>(&self, retry_after: Duration) -> BreakerError<E> {
        self.metrics.record_rejection();
        tracing::debug!(breaker = %self.name, retry_after = ?retry_after, "Call rejected, circuit open");
        BreakerError::Open {
            name: self.name.clone(),
            retry_after,
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.opened_at_wall = None;
            inner.probe_in_flight = false;
            tracing::info!(breaker = %self.name, "Probe succeeded, circuit closed");
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if probe {
            inner.probe_in_flight = false;
            self.open(&mut inner);
            tracing::warn!(breaker = %self.name, "Probe failed, circuit re-opened");
        } else if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            self.open(&mut inner);
            tracing::warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                recovery_timeout = ?self.config.recovery_timeout,
                "Circuit opened"
            );
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(self.clock.monotonic());
        inner.opened_at_wall = Some(self.clock.now());
        self.metrics.record_open();
    }
}

/// Admission to run one call. Reports the result back to the breaker.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_failure(true);
        }
    }
}
