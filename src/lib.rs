//! Race-safe sequential identifiers, idempotent replay and retry
//! coordination for multi-step registrations.

pub mod allocator;
pub mod breaker;
pub mod config;
pub mod contracts;
pub mod coordinator;
pub mod idempotency;
pub mod metrics;
pub mod storage;
