use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contracts::error::StorageError;

/// A formatted sequential identifier, e.g. `ICCT-007`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    /// Counter value the identifier was built from.
    pub number: u64,
    /// Human-readable form.
    pub value: String,
}

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Reference to an artifact in the external object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Final result of one `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome<R> {
    /// Record committed.
    Success(R),
    /// The request was not run because of its idempotency key.
    Conflict(ConflictKind),
    /// Terminal failure. Cached like a success.
    Failure(FailureReason),
}

impl<R> Outcome<R> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn success(&self) -> Option<&R> {
        match self {
            Outcome::Success(record) => Some(record),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Same key, different payload fingerprint.
    FingerprintMismatch,
    /// Same key and payload, but another execution still holds the pending
    /// marker and did not finish within the wait window.
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Every attempt hit a retryable failure.
    RetriesExhausted { attempts: u32, last_error: String },
    /// The per-execution deadline passed mid-loop.
    DeadlineExceeded { attempts: u32 },
    /// Persist step failed with a non-retryable error.
    Persistence { message: String },
    /// Counter backend failed with a non-retryable error.
    Allocation { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "retries exhausted after {attempts} attempts: {last_error}"),
            FailureReason::DeadlineExceeded { attempts } => {
                write!(f, "deadline exceeded after {attempts} attempts")
            }
            FailureReason::Persistence { message } => write!(f, "persistence failed: {message}"),
            FailureReason::Allocation { message } => write!(f, "allocation failed: {message}"),
        }
    }
}

/// Artifacts uploaded by an attempt that was never committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanedAttempt {
    pub identifier: Identifier,
    pub attempt: u32,
    pub artifacts: Vec<ArtifactRef>,
    pub reason: String,
    pub discarded_at: DateTime<Utc>,
}

/// Backlog of orphaned artifacts awaiting a cleanup sweep.
///
/// Entries are keyed by identifier. Identifiers are never reused, so each
/// discarded attempt gets its own entry.
pub trait OrphanLedger: Send + Sync {
    fn record_orphan(&self, orphan: OrphanedAttempt) -> Result<(), StorageError>;

    /// Returns every orphan not yet resolved, in identifier order.
    fn pending_orphans(&self) -> Result<Vec<OrphanedAttempt>, StorageError>;

    /// Removes the entry once its artifacts are deleted. Returns false if
    /// nothing was recorded for `identifier`.
    fn resolve_orphan(&self, identifier: &Identifier) -> Result<bool, StorageError>;
}
