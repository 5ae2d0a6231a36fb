//! Retry budget and backoff schedule for the attempt loop.

use backon::ExponentialBuilder;
use std::time::Duration;

use crate::config::{env_flag, env_or};
use crate::contracts::RegistrarError;

/// Retry configuration with exponential backoff.
///
/// The delay before attempt `n + 1` is `base_delay * multiplier^(n - 1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per execution, including the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f32,
    pub max_delay: Duration,
    /// Randomize each delay to spread out callers retrying in lockstep.
    pub jitter: bool,
    /// Upper bound on one execution, attempts and backoff included.
    pub deadline: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: false,
            deadline: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Creates a RetryConfig from environment variables.
    ///
    /// Environment variables:
    /// - `REGISTRAR_MAX_RETRIES`: attempts per execution (default: 3)
    /// - `REGISTRAR_RETRY_BASE_MS`: first backoff delay in ms (default: 100)
    /// - `REGISTRAR_RETRY_MULTIPLIER`: backoff growth factor (default: 2.0)
    /// - `REGISTRAR_RETRY_MAX_MS`: backoff cap in ms (default: 5000)
    /// - `REGISTRAR_RETRY_JITTER`: add jitter (default: false)
    /// - `REGISTRAR_DEADLINE_MS`: per-execution deadline in ms (default: 30000)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_retries: env_or("REGISTRAR_MAX_RETRIES", default.max_retries),
            base_delay: Duration::from_millis(env_or(
                "REGISTRAR_RETRY_BASE_MS",
                default.base_delay.as_millis() as u64,
            )),
            multiplier: env_or("REGISTRAR_RETRY_MULTIPLIER", default.multiplier),
            max_delay: Duration::from_millis(env_or(
                "REGISTRAR_RETRY_MAX_MS",
                default.max_delay.as_millis() as u64,
            )),
            jitter: env_flag("REGISTRAR_RETRY_JITTER", default.jitter),
            deadline: Duration::from_millis(env_or(
                "REGISTRAR_DEADLINE_MS",
                default.deadline.as_millis() as u64,
            )),
        }
    }

    pub fn validate(&self) -> Result<(), RegistrarError> {
        if self.max_retries == 0 {
            return Err(RegistrarError::Config("max retries must be >= 1".into()));
        }
        if !(self.multiplier >= 1.0) {
            return Err(RegistrarError::Config(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(RegistrarError::Config(
                "retry max delay must not be below the base delay".into(),
            ));
        }
        if self.deadline.is_zero() {
            return Err(RegistrarError::Config("deadline must be > 0".into()));
        }
        Ok(())
    }

    /// Backoff schedule yielding one delay per retry
    /// (`max_retries - 1` delays in total).
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_factor(self.multiplier)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries.saturating_sub(1) as usize);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}
