use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Source of time for expiry, breaker recovery and deadline checks.
///
/// `now()` is wall-clock time and is what gets persisted (`created_at`,
/// `expires_at`). `monotonic()` never goes backwards and is used for
/// in-process intervals.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Time elapsed since the clock was created.
    fn monotonic(&self) -> Duration;
}

/// Clock backed by the operating system.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Clock that only moves when told to.
///
/// Both readings advance together, so breaker timeouts and record expiry
/// can be driven deterministically from tests.
pub struct ManualClock {
    start: DateTime<Utc>,
    offset_us: AtomicU64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            offset_us: AtomicU64::new(0),
        }
    }

    /// Moves both the wall clock and the monotonic clock forward.
    pub fn advance(&self, by: Duration) {
        let us = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        self.offset_us.fetch_add(us, Ordering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let offset = self.monotonic();
        let offset = chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::MAX);
        self.start + offset
    }

    fn monotonic(&self) -> Duration {
        Duration::from_micros(self.offset_us.load(Ordering::Acquire))
    }
}
