//! Environment-driven configuration.
//!
//! Every component has a plain config struct with `Default` and a
//! `from_env()` constructor. Unset or unparsable variables fall back to
//! the default value.

use std::path::PathBuf;
use std::str::FromStr;

use crate::allocator::AllocatorConfig;
use crate::breaker::BreakerConfig;
use crate::contracts::RegistrarError;
use crate::coordinator::RetryConfig;
use crate::idempotency::IdempotencyPolicy;

/// Reads `name` and parses it, falling back to `default`.
pub(crate) fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Reads a boolean flag. Accepts `1`/`true`/`yes` and `0`/`false`/`no`.
pub(crate) fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Full configuration for the maintenance binary.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub allocator: AllocatorConfig,
    pub retry: RetryConfig,
    pub idempotency: IdempotencyPolicy,
    pub breaker: BreakerConfig,
}

impl Settings {
    /// Loads every section from the environment.
    ///
    /// Environment variables:
    /// - `REGISTRAR_DATA_DIR`: RocksDB directory (default: ./data)
    /// - see `AllocatorConfig`, `RetryConfig`, `IdempotencyPolicy` and
    ///   `BreakerConfig` for the rest
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("REGISTRAR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            allocator: AllocatorConfig::from_env(),
            retry: RetryConfig::from_env(),
            idempotency: IdempotencyPolicy::from_env(),
            breaker: BreakerConfig::from_env(),
        }
    }

    /// Rejects combinations that would break the coordinator's guarantees.
    pub fn validate(&self) -> Result<(), RegistrarError> {
        self.retry.validate()?;
        self.idempotency.validate()?;
        self.breaker.validate()?;
        if self.idempotency.pending_grace <= self.retry.deadline {
            return Err(RegistrarError::Config(format!(
                "pending grace ({:?}) must exceed the execution deadline ({:?})",
                self.idempotency.pending_grace, self.retry.deadline
            )));
        }
        Ok(())
    }
}
