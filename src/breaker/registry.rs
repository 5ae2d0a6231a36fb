use std::fmt::Write;
use std::sync::Arc;

use dashmap::DashMap;

use super::{BreakerConfig, CircuitBreaker, CircuitBreakerState, CircuitState};
use crate::contracts::Clock;

/// Breaker guarding artifact uploads.
pub const OBJECT_STORAGE: &str = "object-storage";
/// Breaker guarding outbound notifications.
pub const NOTIFICATIONS: &str = "notifications";

/// One breaker per named dependency, shared by every caller.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            clock,
        }
    }

    /// Returns the breaker for `name`, creating it with the registry's
    /// default config on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.config.clone())
    }

    /// Like `get_or_create`, but a newly created breaker uses `config`.
    /// An existing breaker keeps its original config.
    pub fn get_or_create_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, "Registered circuit breaker");
                Arc::new(CircuitBreaker::new(name, config, Arc::clone(&self.clock)))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Health view of every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Names of breakers that are not closed.
    pub fn degraded(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|s| s.state != CircuitState::Closed)
            .map(|s| s.name)
            .collect()
    }

    /// Formats breaker state and counters in Prometheus exposition format.
    pub fn format_prometheus(&self) -> String {
        let mut breakers: Vec<_> = self.breakers.iter().map(|b| Arc::clone(b.value())).collect();
        breakers.sort_by(|a, b| a.name().cmp(b.name()));

        let mut output = String::with_capacity(512);
        let _ = writeln!(
            output,
            "# HELP registrar_breaker_state Circuit state (0=closed, 1=half_open, 2=open)"
        );
        let _ = writeln!(output, "# TYPE registrar_breaker_state gauge");
        for breaker in &breakers {
            let value = match breaker.state() {
                CircuitState::Closed => 0,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 2,
            };
            let _ = writeln!(
                output,
                "registrar_breaker_state{{breaker=\"{}\"}} {}",
                breaker.name(),
                value
            );
        }
        output.push('\n');

        for breaker in &breakers {
            output.push_str(&breaker.metrics().format_prometheus(breaker.name()));
        }
        output
    }
}
