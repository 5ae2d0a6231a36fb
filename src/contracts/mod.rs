pub mod clock;
pub mod error;
pub mod idempotency;
pub mod pipeline;
pub mod sequence;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{
    AttemptError, BreakerError, ErrorClass, IdempotencyError, LockResultExt, PersistError,
    RegistrarError, RetryReason, SequenceError, StorageError, UploadError,
};
pub use idempotency::{IdempotencyRecord, IdempotencyStore};
pub use pipeline::{
    ArtifactRef, ConflictKind, FailureReason, Identifier, OrphanLedger, OrphanedAttempt, Outcome,
};
pub use sequence::{RecordIndex, SequenceStore};
