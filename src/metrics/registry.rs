//! Counters for the registration pipeline and its circuit breakers.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::Histogram;
use crate::contracts::RetryReason;

/// Central registry for process-wide metrics.
#[derive(Default)]
pub struct MetricsRegistry {
    pub coordinator: Arc<CoordinatorMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formats all metrics in Prometheus exposition format.
    pub fn format_prometheus(&self) -> String {
        self.coordinator.format_prometheus()
    }
}

fn write_counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} counter", name);
    let _ = writeln!(output, "{} {}", name, value);
    output.push('\n');
}

/// Terminal status of one `execute` call, for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Replayed,
    Conflict,
    Failure,
}

/// Metrics for the attempt coordinator.
#[derive(Default)]
pub struct CoordinatorMetrics {
    pub executions_success_total: AtomicU64,
    pub executions_replayed_total: AtomicU64,
    pub executions_conflict_total: AtomicU64,
    pub executions_failure_total: AtomicU64,
    /// Individual allocate/upload/persist attempts started.
    pub attempts_total: AtomicU64,
    pub retries_lock_total: AtomicU64,
    pub retries_upload_total: AtomicU64,
    pub retries_circuit_open_total: AtomicU64,
    pub retries_conflict_total: AtomicU64,
    /// Attempts abandoned with uploaded artifacts left behind.
    pub orphaned_attempts_total: AtomicU64,
    pub deadline_exceeded_total: AtomicU64,
    pub retries_exhausted_total: AtomicU64,
    pub terminal_failures_total: AtomicU64,
    /// Wall time of executions that ran the pipeline (replays excluded).
    pub execution_latency_ms: Histogram,
}

impl CoordinatorMetrics {
    #[inline]
    pub fn record_attempt(&self) {
        self.attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retry(&self, reason: RetryReason) {
        let counter = match reason {
            RetryReason::Lock => &self.retries_lock_total,
            RetryReason::Upload => &self.retries_upload_total,
            RetryReason::CircuitOpen => &self.retries_circuit_open_total,
            RetryReason::Conflict => &self.retries_conflict_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_orphan(&self) {
        self.orphaned_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_deadline_exceeded(&self) {
        self.deadline_exceeded_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exhausted(&self) {
        self.retries_exhausted_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_terminal(&self) {
        self.terminal_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished execution. `elapsed` is ignored for replays.
    pub fn record_execution(&self, status: ExecutionStatus, elapsed: Duration) {
        let counter = match status {
            ExecutionStatus::Success => &self.executions_success_total,
            ExecutionStatus::Replayed => &self.executions_replayed_total,
            ExecutionStatus::Conflict => &self.executions_conflict_total,
            ExecutionStatus::Failure => &self.executions_failure_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if status != ExecutionStatus::Replayed {
            self.execution_latency_ms.observe(elapsed);
        }
    }

    pub fn retries_total(&self) -> u64 {
        self.retries_lock_total.load(Ordering::Relaxed)
            + self.retries_upload_total.load(Ordering::Relaxed)
            + self.retries_circuit_open_total.load(Ordering::Relaxed)
            + self.retries_conflict_total.load(Ordering::Relaxed)
    }

    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        let _ = writeln!(
            output,
            "# HELP registrar_executions_total Registration executions by outcome"
        );
        let _ = writeln!(output, "# TYPE registrar_executions_total counter");
        for (label, counter) in [
            ("success", &self.executions_success_total),
            ("replayed", &self.executions_replayed_total),
            ("conflict", &self.executions_conflict_total),
            ("failure", &self.executions_failure_total),
        ] {
            let _ = writeln!(
                output,
                "registrar_executions_total{{outcome=\"{}\"}} {}",
                label,
                counter.load(Ordering::Relaxed)
            );
        }
        output.push('\n');

        write_counter(
            &mut output,
            "registrar_attempts_total",
            "Pipeline attempts started",
            self.attempts_total.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            output,
            "# HELP registrar_retries_total Attempts retried with a fresh identifier, by reason"
        );
        let _ = writeln!(output, "# TYPE registrar_retries_total counter");
        for (label, counter) in [
            ("lock", &self.retries_lock_total),
            ("upload", &self.retries_upload_total),
            ("circuit_open", &self.retries_circuit_open_total),
            ("conflict", &self.retries_conflict_total),
        ] {
            let _ = writeln!(
                output,
                "registrar_retries_total{{reason=\"{}\"}} {}",
                label,
                counter.load(Ordering::Relaxed)
            );
        }
        output.push('\n');

        write_counter(
            &mut output,
            "registrar_orphaned_attempts_total",
            "Abandoned attempts that left uploaded artifacts behind",
            self.orphaned_attempts_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "registrar_deadline_exceeded_total",
            "Executions stopped by the overall deadline",
            self.deadline_exceeded_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "registrar_retries_exhausted_total",
            "Executions that used every attempt without success",
            self.retries_exhausted_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "registrar_terminal_failures_total",
            "Executions stopped by a non-retryable error",
            self.terminal_failures_total.load(Ordering::Relaxed),
        );

        output.push_str(&self.execution_latency_ms.format_prometheus(
            "registrar_execution_latency_ms",
            "Histogram of registration execution time in milliseconds",
        ));
        output.push('\n');

        output
    }
}

/// Per-breaker counters. The current state is exported by the breaker
/// registry.
#[derive(Default)]
pub struct BreakerMetrics {
    rejected_total: AtomicU64,
    opened_total: AtomicU64,
}

impl BreakerMetrics {
    #[inline]
    pub fn record_rejection(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_open(&self) {
        self.opened_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::Relaxed)
    }

    pub fn format_prometheus(&self, breaker: &str) -> String {
        let mut output = String::with_capacity(256);
        let _ = writeln!(
            output,
            "registrar_breaker_rejected_total{{breaker=\"{}\"}} {}",
            breaker,
            self.rejected_total()
        );
        let _ = writeln!(
            output,
            "registrar_breaker_opened_total{{breaker=\"{}\"}} {}",
            breaker,
            self.opened_total()
        );
        output
    }
}
