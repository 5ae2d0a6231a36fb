//! Observability metrics.
//!
//! All counters are lock-free atomics so recording never contends with the
//! registration hot path.

pub mod histogram;
pub mod registry;

pub use histogram::Histogram;
pub use registry::{BreakerMetrics, CoordinatorMetrics, ExecutionStatus, MetricsRegistry};
