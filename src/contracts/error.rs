use std::sync::{MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistrarError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("Idempotency error: {0}")]
    Idempotency(#[from] IdempotencyError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Extension trait for converting lock errors to StorageError.
pub trait LockResultExt<T> {
    /// Converts a lock error to a StorageError.
    fn map_lock_err(self) -> Result<T, StorageError>;
}

impl<'a, T> LockResultExt<RwLockReadGuard<'a, T>>
    for Result<RwLockReadGuard<'a, T>, PoisonError<RwLockReadGuard<'a, T>>>
{
    #[inline]
    fn map_lock_err(self) -> Result<RwLockReadGuard<'a, T>, StorageError> {
        self.map_err(|e| StorageError::LockPoisoned(e.to_string()))
    }
}

impl<'a, T> LockResultExt<RwLockWriteGuard<'a, T>>
    for Result<RwLockWriteGuard<'a, T>, PoisonError<RwLockWriteGuard<'a, T>>>
{
    #[inline]
    fn map_lock_err(self) -> Result<RwLockWriteGuard<'a, T>, StorageError> {
        self.map_err(|e| StorageError::LockPoisoned(e.to_string()))
    }
}

impl<'a, T> LockResultExt<MutexGuard<'a, T>>
    for Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>
{
    #[inline]
    fn map_lock_err(self) -> Result<MutexGuard<'a, T>, StorageError> {
        self.map_err(|e| StorageError::LockPoisoned(e.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("RocksDB error: {0}")]
    RocksDb(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum SequenceError {
    /// The counter row stayed locked by other allocators for longer than allowed.
    #[error("Timed out after {waited:?} waiting for the sequence lock")]
    LockTimeout { waited: Duration },

    #[error("Sequence overflow")]
    Overflow,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Same key was reused for a different payload.
    #[error("Idempotency key {key} was already used for a different request")]
    Conflict { key: String },

    #[error("Failed to encode cached outcome: {0}")]
    Serialization(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Error returned by the externally supplied upload step.
#[derive(Error, Debug, Clone)]
#[error("Upload failed: {0}")]
pub struct UploadError(pub String);

impl UploadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error returned by the externally supplied persist step.
#[derive(Error, Debug, Clone)]
pub enum PersistError {
    /// The identifier is already taken by another record. Retryable with a new identifier.
    #[error("Identifier {identifier} already exists")]
    UniquenessConflict { identifier: String },

    /// Any other persistence failure. Not retried.
    #[error("Persistence failed: {0}")]
    Other(String),
}

impl From<StorageError> for PersistError {
    fn from(e: StorageError) -> Self {
        PersistError::Other(e.to_string())
    }
}

/// Error returned from a call routed through a circuit breaker.
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    #[error("Circuit {name} is open, retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    #[error(transparent)]
    Inner(E),
}

/// Why a failed attempt may be retried with a fresh identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Lock,
    Upload,
    CircuitOpen,
    Conflict,
}

/// Classification of an attempt failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable(RetryReason),
    Terminal,
}

/// Everything that can end a single allocate → upload → persist attempt.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Circuit {name} is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl From<BreakerError<UploadError>> for AttemptError {
    fn from(e: BreakerError<UploadError>) -> Self {
        match e {
            BreakerError::Open { name, retry_after } => {
                AttemptError::CircuitOpen { name, retry_after }
            }
            BreakerError::Inner(inner) => AttemptError::Upload(inner),
        }
    }
}

impl AttemptError {
    /// Decides whether the coordinator may retry after this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            AttemptError::Sequence(SequenceError::LockTimeout { .. }) => {
                ErrorClass::Retryable(RetryReason::Lock)
            }
            AttemptError::Sequence(SequenceError::Overflow)
            | AttemptError::Sequence(SequenceError::Storage(_)) => ErrorClass::Terminal,
            AttemptError::Upload(_) => ErrorClass::Retryable(RetryReason::Upload),
            AttemptError::CircuitOpen { .. } => ErrorClass::Retryable(RetryReason::CircuitOpen),
            AttemptError::Persist(PersistError::UniquenessConflict { .. }) => {
                ErrorClass::Retryable(RetryReason::Conflict)
            }
            AttemptError::Persist(PersistError::Other(_)) => ErrorClass::Terminal,
        }
    }
}
