use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contracts::error::StorageError;

/// Durable marker for one client-supplied idempotency key.
///
/// The record is pending while `outcome` is `None`. Once an outcome is
/// recorded it is never changed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_fingerprint: String,
    /// Identifies the execution that currently owns the pending marker.
    pub claim_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Key → record map with per-key atomic read-modify-write.
///
/// Different keys never contend. Calls to `mutate` for the same key are
/// serialized.
pub trait IdempotencyStore: Send + Sync {
    /// Reads the record for `key` and lets `f` decide what to store.
    ///
    /// `f` receives the current record (if any) and returns the record to
    /// write (`None` leaves storage untouched) plus a value handed back to
    /// the caller. Read, decision and write happen under one per-key lock.
    fn mutate<T, F>(&self, key: &str, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(Option<&IdempotencyRecord>) -> (Option<IdempotencyRecord>, T);

    /// Returns the stored record for `key`, expired or not.
    fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StorageError>;

    /// Deletes every record whose `expires_at` is at or before `now`.
    /// Returns the number of records removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;
}
