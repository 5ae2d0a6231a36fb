//! Duplicate-submission detection keyed by client-supplied idempotency keys.
//!
//! ## Protocol
//!
//! 1. `begin` looks up the key under its row lock:
//!    - absent or expired: write a pending marker, admit as fresh
//!    - live, different fingerprint: `IdempotencyError::Conflict`
//!    - live, outcome recorded: replay the cached outcome
//!    - live, pending, older than `pending_grace`: the owner is presumed
//!      dead, take the marker over and admit as fresh
//!    - live, pending, within grace: another execution is in flight
//! 2. `complete` stores the outcome, but only if the marker still carries
//!    the caller's claim id.

mod fingerprint;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::env_or;
use crate::contracts::{
    Clock, IdempotencyError, IdempotencyRecord, IdempotencyStore, RegistrarError, StorageError,
};

pub use fingerprint::Fingerprint;

/// Default record lifetime (10 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Default age after which a pending marker is treated as abandoned.
///
/// Must stay above the coordinator's execution deadline (30s by default) so
/// a live execution is never taken over.
pub const DEFAULT_PENDING_GRACE: Duration = Duration::from_secs(120);

/// Expiry and in-flight handling for idempotency records.
#[derive(Debug, Clone)]
pub struct IdempotencyPolicy {
    pub ttl: Duration,
    pub pending_grace: Duration,
    /// How long a same-key caller waits for an in-flight execution.
    pub in_flight_wait: Duration,
    /// Poll interval while waiting.
    pub in_flight_poll: Duration,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            pending_grace: DEFAULT_PENDING_GRACE,
            in_flight_wait: Duration::from_secs(2),
            in_flight_poll: Duration::from_millis(50),
        }
    }
}

impl IdempotencyPolicy {
    /// Creates an IdempotencyPolicy from environment variables.
    ///
    /// Environment variables:
    /// - `REGISTRAR_IDEMPOTENCY_TTL_SECS` (default: 600)
    /// - `REGISTRAR_IDEMPOTENCY_PENDING_GRACE_SECS` (default: 120)
    /// - `REGISTRAR_IDEMPOTENCY_IN_FLIGHT_WAIT_MS` (default: 2000)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            ttl: Duration::from_secs(env_or(
                "REGISTRAR_IDEMPOTENCY_TTL_SECS",
                default.ttl.as_secs(),
            )),
            pending_grace: Duration::from_secs(env_or(
                "REGISTRAR_IDEMPOTENCY_PENDING_GRACE_SECS",
                default.pending_grace.as_secs(),
            )),
            in_flight_wait: Duration::from_millis(env_or(
                "REGISTRAR_IDEMPOTENCY_IN_FLIGHT_WAIT_MS",
                default.in_flight_wait.as_millis() as u64,
            )),
            in_flight_poll: default.in_flight_poll,
        }
    }

    pub fn validate(&self) -> Result<(), RegistrarError> {
        if self.ttl.is_zero() {
            return Err(RegistrarError::Config("idempotency ttl must be > 0".into()));
        }
        if self.pending_grace >= self.ttl {
            return Err(RegistrarError::Config(format!(
                "pending grace ({:?}) must be shorter than ttl ({:?})",
                self.pending_grace, self.ttl
            )));
        }
        if self.in_flight_poll.is_zero() {
            return Err(RegistrarError::Config("in-flight poll interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Proof that this caller owns the pending marker for `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub key: String,
    pub claim_id: Uuid,
    pub fingerprint: Fingerprint,
    /// True if the marker was taken over from an abandoned execution.
    pub took_over: bool,
}

/// Result of `begin`.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// No live record existed. The caller must run the pipeline and call `complete`.
    Fresh(Claim),
    /// The request already ran. Holds the cached outcome snapshot.
    Replay(serde_json::Value),
    /// Another execution with the same key and payload is still running.
    InFlight { started_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Claim { took_over: bool },
    Replay(serde_json::Value),
    InFlight(DateTime<Utc>),
    Conflict,
}

fn decide(
    existing: Option<&IdempotencyRecord>,
    fingerprint: &str,
    now: DateTime<Utc>,
    policy: &IdempotencyPolicy,
) -> Decision {
    let record = match existing {
        Some(record) if !record.is_expired(now) => record,
        _ => return Decision::Claim { took_over: false },
    };

    if record.is_pending() && now - record.created_at >= chrono_duration(policy.pending_grace) {
        return Decision::Claim { took_over: true };
    }
    if record.request_fingerprint != fingerprint {
        return Decision::Conflict;
    }
    match &record.outcome {
        Some(outcome) => Decision::Replay(outcome.clone()),
        None => Decision::InFlight(record.created_at),
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Guards the registration pipeline against duplicate submissions.
pub struct IdempotencyGuard<I: IdempotencyStore> {
    store: Arc<I>,
    clock: Arc<dyn Clock>,
    policy: IdempotencyPolicy,
}

impl<I: IdempotencyStore> IdempotencyGuard<I> {
    pub fn new(store: Arc<I>, clock: Arc<dyn Clock>, policy: IdempotencyPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &IdempotencyPolicy {
        &self.policy
    }

    /// Inspects `key` and claims it if no live record exists.
    pub fn begin(&self, key: &str, fingerprint: &Fingerprint) -> Result<Admission, IdempotencyError> {
        let now = self.clock.now();
        let claim_id = Uuid::new_v4();
        let ttl = chrono_duration(self.policy.ttl);

        let decision = self.store.mutate(key, |existing| {
            let decision = decide(existing, fingerprint.as_str(), now, &self.policy);
            let write = match decision {
                Decision::Claim { .. } => Some(IdempotencyRecord {
                    key: key.to_string(),
                    request_fingerprint: fingerprint.as_str().to_string(),
                    claim_id,
                    outcome: None,
                    created_at: now,
                    expires_at: now + ttl,
                }),
                _ => None,
            };
            (write, decision)
        })?;

        match decision {
            Decision::Claim { took_over } => {
                if took_over {
                    tracing::warn!(key = key, "Taking over abandoned pending idempotency marker");
                }
                Ok(Admission::Fresh(Claim {
                    key: key.to_string(),
                    claim_id,
                    fingerprint: fingerprint.clone(),
                    took_over,
                }))
            }
            Decision::Replay(outcome) => {
                tracing::debug!(key = key, "Replaying cached outcome");
                Ok(Admission::Replay(outcome))
            }
            Decision::InFlight(started_at) => Ok(Admission::InFlight { started_at }),
            Decision::Conflict => {
                tracing::warn!(key = key, "Idempotency key reused with a different payload");
                Err(IdempotencyError::Conflict {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Like `begin`, but waits up to `in_flight_wait` for a concurrent
    /// execution of the same request to finish.
    pub async fn admit(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Admission, IdempotencyError> {
        let wait_until = tokio::time::Instant::now() + self.policy.in_flight_wait;
        loop {
            let admission = self.begin(key, fingerprint)?;
            match admission {
                Admission::InFlight { .. } if tokio::time::Instant::now() < wait_until => {
                    tokio::time::sleep(self.policy.in_flight_poll).await;
                }
                other => return Ok(other),
            }
        }
    }

    /// Records the final outcome for a claimed key and restarts its TTL.
    ///
    /// Returns false (and writes nothing) if the claim was superseded or an
    /// outcome is already present.
    pub fn complete<T: Serialize>(
        &self,
        claim: &Claim,
        outcome: &T,
    ) -> Result<bool, IdempotencyError> {
        let value = serde_json::to_value(outcome)
            .map_err(|e| IdempotencyError::Serialization(e.to_string()))?;
        let now = self.clock.now();
        let ttl = chrono_duration(self.policy.ttl);

        let written = self.store.mutate(&claim.key, |existing| match existing {
            Some(record) if record.claim_id == claim.claim_id && record.is_pending() => {
                let mut record = record.clone();
                record.outcome = Some(value);
                record.expires_at = now + ttl;
                (Some(record), true)
            }
            _ => (None, false),
        })?;

        if !written {
            tracing::warn!(
                key = %claim.key,
                "Idempotency claim superseded, outcome not recorded"
            );
        }
        Ok(written)
    }

    /// Returns the live record for `key`, ignoring expired ones.
    pub fn lookup(&self, key: &str) -> Result<Option<IdempotencyRecord>, StorageError> {
        let now = self.clock.now();
        Ok(self.store.get(key)?.filter(|r| !r.is_expired(now)))
    }

    /// Deletes expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, StorageError> {
        let removed = self.store.purge_expired(self.clock.now())?;
        if removed > 0 {
            tracing::info!(removed = removed, "Purged expired idempotency records");
        }
        Ok(removed)
    }
}
