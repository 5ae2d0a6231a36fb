//! Lock-free latency histogram with fixed Prometheus buckets.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bucket upper bounds in milliseconds. A registration spans the whole
/// allocate/upload/persist pipeline, so the range runs up to the default
/// execution deadline.
pub const HISTOGRAM_BUCKETS: [u64; 13] = [
    1, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000,
];

const BUCKET_COUNT: usize = HISTOGRAM_BUCKETS.len();

/// Latency distribution with cumulative buckets.
///
/// ```
/// use registrar::metrics::Histogram;
///
/// let histogram = Histogram::new();
/// histogram.observe_ms(150);
///
/// let (sum, count, _) = histogram.snapshot();
/// assert_eq!(count, 1);
/// assert_eq!(sum, 150);
/// ```
pub struct Histogram {
    sum: AtomicU64,
    count: AtomicU64,
    buckets: [AtomicU64; BUCKET_COUNT],
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn observe_ms(&self, value_ms: u64) {
        self.sum.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for (bucket, &bound) in self.buckets.iter().zip(HISTOGRAM_BUCKETS.iter()) {
            if value_ms <= bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn observe(&self, elapsed: Duration) {
        self.observe_ms(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
    }

    /// Returns `(sum, count, cumulative_buckets)`.
    pub fn snapshot(&self) -> (u64, u64, [u64; BUCKET_COUNT]) {
        let buckets = std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed));
        (
            self.sum.load(Ordering::Relaxed),
            self.count.load(Ordering::Relaxed),
            buckets,
        )
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn format_prometheus(&self, name: &str, help: &str) -> String {
        let (sum, count, buckets) = self.snapshot();
        let mut output = String::with_capacity(1024);

        let _ = writeln!(output, "# HELP {} {}", name, help);
        let _ = writeln!(output, "# TYPE {} histogram", name);
        for (bound, value) in HISTOGRAM_BUCKETS.iter().zip(buckets.iter()) {
            let _ = writeln!(output, "{}_bucket{{le=\"{}\"}} {}", name, bound, value);
        }
        let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", name, count);
        let _ = writeln!(output, "{}_sum {}", name, sum);
        let _ = writeln!(output, "{}_count {}", name, count);

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_cumulative() {
        let h = Histogram::new();
        h.observe_ms(1);
        h.observe_ms(7);
        h.observe_ms(400);
        h.observe_ms(60_000);

        let (sum, count, buckets) = h.snapshot();
        assert_eq!(count, 4);
        assert_eq!(sum, 60_408);
        assert_eq!(buckets[0], 1); // <= 1ms
        assert_eq!(buckets[1], 1); // <= 5ms
        assert_eq!(buckets[2], 2); // <= 10ms
        assert_eq!(buckets[7], 3); // <= 500ms
        assert_eq!(buckets[BUCKET_COUNT - 1], 3); // 60s falls only in +Inf
    }

    #[test]
    fn observe_duration_truncates_to_millis() {
        let h = Histogram::new();
        h.observe(Duration::from_micros(2_900));
        assert_eq!(h.snapshot().0, 2);
    }

    #[test]
    fn prometheus_format() {
        let h = Histogram::new();
        h.observe_ms(20);
        h.observe_ms(30);

        let output = h.format_prometheus("registration_latency_ms", "Registration latency");
        assert!(output.contains("# TYPE registration_latency_ms histogram"));
        assert!(output.contains("registration_latency_ms_bucket{le=\"25\"} 1"));
        assert!(output.contains("registration_latency_ms_bucket{le=\"+Inf\"} 2"));
        assert!(output.contains("registration_latency_ms_sum 50"));
    }

    #[test]
    fn concurrent_observations_are_all_counted() {
        use std::sync::Arc;
        use std::thread;

        let h = Arc::new(Histogram::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let h = Arc::clone(&h);
                thread::spawn(move || {
                    for i in 0..500 {
                        h.observe_ms(i % 100);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(h.count(), 4_000);
    }
}
