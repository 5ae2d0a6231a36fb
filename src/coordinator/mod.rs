//! The registration pipeline: idempotency check, then up to `max_retries`
//! allocate → upload → persist attempts, each with a fresh identifier.

mod attempt;
mod retry;

use std::future::Future;
use std::sync::Arc;

use backon::BackoffBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::allocator::{AllocatorConfig, SequenceAllocator};
use crate::breaker::CircuitBreaker;
use crate::contracts::{
    ArtifactRef, AttemptError, Clock, ConflictKind, ErrorClass, FailureReason, IdempotencyError,
    IdempotencyStore, Identifier, OrphanLedger, Outcome, PersistError, RegistrarError,
    SequenceStore, UploadError,
};
use crate::idempotency::{Admission, Claim, Fingerprint, IdempotencyGuard, IdempotencyPolicy};
use crate::metrics::{CoordinatorMetrics, ExecutionStatus};

pub use attempt::{AttemptStatus, RegistrationAttempt};
pub use retry::RetryConfig;

/// Runs registrations with bounded retries.
///
/// # Guarantees
/// - An identifier is used by at most one attempt. A failed attempt's
///   identifier is burned, and its uploaded artifacts go to the orphan
///   ledger instead of being reused.
/// - Every success or terminal failure is recorded against the
///   idempotency key before `execute` returns, so a resubmission replays
///   it instead of running the pipeline again.
/// - The sequence lock is only held inside `SequenceAllocator::allocate`,
///   never across the upload or persist steps.
pub struct AttemptCoordinator<S: SequenceStore, I: IdempotencyStore, O: OrphanLedger> {
    allocator: SequenceAllocator<S>,
    guard: IdempotencyGuard<I>,
    orphans: Arc<O>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<CoordinatorMetrics>,
}

impl<T> AttemptCoordinator<T, T, T>
where
    T: SequenceStore + IdempotencyStore + OrphanLedger,
{
    /// Builds a coordinator whose counter, idempotency records and orphan
    /// ledger all live in one backend.
    pub fn with_store(
        store: Arc<T>,
        allocator: AllocatorConfig,
        policy: IdempotencyPolicy,
        retry: RetryConfig,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            SequenceAllocator::new(Arc::clone(&store), allocator),
            IdempotencyGuard::new(Arc::clone(&store), Arc::clone(&clock), policy),
            store,
            breaker,
            retry,
            clock,
        )
    }
}

impl<S, I, O> AttemptCoordinator<S, I, O>
where
    S: SequenceStore,
    I: IdempotencyStore,
    O: OrphanLedger,
{
    pub fn new(
        allocator: SequenceAllocator<S>,
        guard: IdempotencyGuard<I>,
        orphans: Arc<O>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            allocator,
            guard,
            orphans,
            breaker,
            retry,
            clock,
            metrics: Arc::new(CoordinatorMetrics::default()),
        }
    }

    /// Shares an existing metrics instance instead of a private one.
    pub fn with_metrics(mut self, metrics: Arc<CoordinatorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn allocator(&self) -> &SequenceAllocator<S> {
        &self.allocator
    }

    pub fn guard(&self) -> &IdempotencyGuard<I> {
        &self.guard
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<CoordinatorMetrics> {
        &self.metrics
    }

    /// Runs one registration.
    ///
    /// `upload` receives the attempt's identifier and returns references to
    /// the artifacts it stored; it is routed through the circuit breaker.
    /// `persist` receives the same identifier plus those references and
    /// writes the record. A `PersistError::UniquenessConflict` must leave no
    /// partial writes behind; it is retried with a new identifier. Any other
    /// persist error ends the execution.
    ///
    /// Only idempotency store failures that happen before anything runs
    /// are returned as `Err`. Everything else is an `Outcome`.
    pub async fn execute<R, U, UF, P, PF>(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        upload: U,
        persist: P,
    ) -> Result<Outcome<R>, RegistrarError>
    where
        R: Serialize + DeserializeOwned,
        U: Fn(Identifier) -> UF,
        UF: Future<Output = Result<Vec<ArtifactRef>, UploadError>>,
        P: Fn(Identifier, Vec<ArtifactRef>) -> PF,
        PF: Future<Output = Result<R, PersistError>>,
    {
        let started = Instant::now();

        let claim = match self.guard.admit(key, fingerprint).await {
            Ok(Admission::Fresh(claim)) => claim,
            Ok(Admission::Replay(snapshot)) => {
                let outcome: Outcome<R> = serde_json::from_value(snapshot)
                    .map_err(|e| IdempotencyError::Serialization(e.to_string()))?;
                self.metrics
                    .record_execution(ExecutionStatus::Replayed, started.elapsed());
                return Ok(outcome);
            }
            Ok(Admission::InFlight { started_at }) => {
                tracing::info!(
                    key = key,
                    started_at = %started_at,
                    "Same request still in flight, not running it twice"
                );
                self.metrics
                    .record_execution(ExecutionStatus::Conflict, started.elapsed());
                return Ok(Outcome::Conflict(ConflictKind::InFlight));
            }
            Err(IdempotencyError::Conflict { .. }) => {
                self.metrics
                    .record_execution(ExecutionStatus::Conflict, started.elapsed());
                return Ok(Outcome::Conflict(ConflictKind::FingerprintMismatch));
            }
            Err(e) => return Err(e.into()),
        };

        let deadline = started + self.retry.deadline;
        let outcome = self.run(&claim, deadline, &upload, &persist).await;

        if let Err(e) = self.guard.complete(&claim, &outcome) {
            tracing::error!(key = key, error = %e, "Failed to record outcome for idempotency key");
        }
        let status = if outcome.is_success() {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failure
        };
        self.metrics.record_execution(status, started.elapsed());
        Ok(outcome)
    }

    async fn run<R, U, UF, P, PF>(
        &self,
        claim: &Claim,
        deadline: Instant,
        upload: &U,
        persist: &P,
    ) -> Outcome<R>
    where
        U: Fn(Identifier) -> UF,
        UF: Future<Output = Result<Vec<ArtifactRef>, UploadError>>,
        P: Fn(Identifier, Vec<ArtifactRef>) -> PF,
        PF: Future<Output = Result<R, PersistError>>,
    {
        let max_attempts = self.retry.max_retries.max(1);
        let mut backoff = self.retry.backoff().build();
        let mut last_error = String::new();

        for attempt_number in 1..=max_attempts {
            let mut attempt = RegistrationAttempt::new(attempt_number);
            self.metrics.record_attempt();

            let remaining = deadline.saturating_duration_since(Instant::now());
            let result =
                tokio::time::timeout(remaining, self.run_attempt(&mut attempt, upload, persist))
                    .await;

            let error = match result {
                Ok(Ok(value)) => {
                    attempt.commit();
                    tracing::info!(
                        key = %claim.key,
                        identifier = ?attempt.identifier.as_ref().map(Identifier::as_str),
                        attempt = attempt_number,
                        "Registration committed"
                    );
                    return Outcome::Success(value);
                }
                Ok(Err(e)) => e,
                Err(_) => {
                    self.discard(&mut attempt, "deadline exceeded");
                    return self.deadline_exceeded(claim, attempt_number);
                }
            };

            let message = error.to_string();
            self.discard(&mut attempt, &message);
            let reason = match error.class() {
                ErrorClass::Retryable(reason) => reason,
                ErrorClass::Terminal => return self.terminal(claim, error),
            };
            last_error = message;
            if attempt_number == max_attempts {
                break;
            }

            let delay = backoff.next().unwrap_or(self.retry.max_delay);
            if Instant::now() + delay >= deadline {
                return self.deadline_exceeded(claim, attempt_number);
            }
            self.metrics.record_retry(reason);
            tracing::warn!(
                key = %claim.key,
                attempt = attempt_number,
                reason = ?reason,
                retry_in = ?delay,
                error = %last_error,
                "Attempt failed, retrying with a fresh identifier"
            );
            tokio::time::sleep(delay).await;
        }

        self.metrics.record_exhausted();
        tracing::warn!(
            key = %claim.key,
            attempts = max_attempts,
            error = %last_error,
            "Retries exhausted"
        );
        Outcome::Failure(FailureReason::RetriesExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn run_attempt<R, U, UF, P, PF>(
        &self,
        attempt: &mut RegistrationAttempt,
        upload: &U,
        persist: &P,
    ) -> Result<R, AttemptError>
    where
        U: Fn(Identifier) -> UF,
        UF: Future<Output = Result<Vec<ArtifactRef>, UploadError>>,
        P: Fn(Identifier, Vec<ArtifactRef>) -> PF,
        PF: Future<Output = Result<R, PersistError>>,
    {
        let identifier = self.allocator.allocate()?;
        attempt.identifier = Some(identifier.clone());
        tracing::debug!(
            identifier = %identifier,
            attempt = attempt.attempt_number,
            "Attempt started"
        );

        let artifacts = self.breaker.call(|| upload(identifier.clone())).await?;
        attempt.uploaded_artifacts = artifacts.clone();

        Ok(persist(identifier, artifacts).await?)
    }

    /// Rolls the attempt back and hands any uploaded artifacts to the
    /// orphan ledger.
    fn discard(&self, attempt: &mut RegistrationAttempt, reason: &str) {
        let identifier = attempt.identifier.as_ref().map(|i| i.value.clone());
        match attempt.roll_back(reason, self.clock.now()) {
            Some(orphan) => {
                self.metrics.record_orphan();
                tracing::warn!(
                    identifier = %orphan.identifier,
                    attempt = orphan.attempt,
                    artifacts = orphan.artifacts.len(),
                    reason = reason,
                    "Attempt discarded, uploaded artifacts orphaned"
                );
                if let Err(e) = self.orphans.record_orphan(orphan) {
                    tracing::error!(error = %e, "Failed to record orphaned artifacts");
                }
            }
            None => tracing::warn!(
                identifier = ?identifier,
                attempt = attempt.attempt_number,
                reason = reason,
                "Attempt discarded"
            ),
        }
    }

    fn terminal<R>(&self, claim: &Claim, error: AttemptError) -> Outcome<R> {
        self.metrics.record_terminal();
        tracing::error!(key = %claim.key, error = %error, "Terminal failure, not retrying");
        let message = error.to_string();
        Outcome::Failure(match error {
            AttemptError::Sequence(_) => FailureReason::Allocation { message },
            _ => FailureReason::Persistence { message },
        })
    }

    fn deadline_exceeded<R>(&self, claim: &Claim, attempts: u32) -> Outcome<R> {
        self.metrics.record_deadline_exceeded();
        tracing::warn!(
            key = %claim.key,
            attempts = attempts,
            deadline = ?self.retry.deadline,
            "Execution deadline exceeded"
        );
        Outcome::Failure(FailureReason::DeadlineExceeded { attempts })
    }
}
