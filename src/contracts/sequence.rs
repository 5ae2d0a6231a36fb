use std::time::Duration;

use crate::contracts::error::{SequenceError, StorageError};

/// Durable single-row counter behind identifier allocation.
///
/// # Invariants
/// - `last_issued` never decreases
/// - `next()` is one atomic unit: lock, read, write, commit, release. A
///   crash anywhere inside it leaves the counter at its previous value.
/// - No two callers ever observe the same value from `next()`
pub trait SequenceStore: Send + Sync {
    /// Locks the counter row, increments it and returns the new value.
    ///
    /// Waits at most `lock_timeout` for the row lock before returning
    /// `SequenceError::LockTimeout`.
    fn next(&self, lock_timeout: Duration) -> Result<u64, SequenceError>;

    /// Returns `last_issued` without incrementing.
    fn current(&self) -> Result<u64, SequenceError>;

    /// Raises `last_issued` to `floor` if it is lower. Never lowers it.
    /// Returns the value after the call.
    fn advance_to(&self, floor: u64, lock_timeout: Duration) -> Result<u64, SequenceError>;
}

/// Read access to the identifiers actually present in persisted records.
pub trait RecordIndex: Send + Sync {
    /// Highest identifier number among stored records, if any exist.
    fn max_issued(&self) -> Result<Option<u64>, StorageError>;
}
