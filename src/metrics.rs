//! # Engine Metrics
//!
//! Lock-free counters for cache and invalidation activity. `scan_truncated`
//! is the observability signal for bounded registration scans: a truncated
//! scan under-invalidates, which is correctness-relevant even though it is
//! never raised as an error.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub local_hits: AtomicU64,
    pub remote_hits: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub invalidations: AtomicU64,
    pub entries_invalidated: AtomicU64,
    /// Registration scans that hit `max_scan` or the script deadline.
    pub scan_truncated: AtomicU64,
    pub locks_acquired: AtomicU64,
    pub lock_waits: AtomicU64,
    pub decode_failures: AtomicU64,
    /// Operations downgraded to miss/no-op under the fail-open policy.
    pub degraded_ops: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
    pub entries_invalidated: u64,
    pub scan_truncated: u64,
    pub locks_acquired: u64,
    pub lock_waits: u64,
    pub decode_failures: u64,
    pub degraded_ops: u64,
}

impl EngineMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries_invalidated: self.entries_invalidated.load(Ordering::Relaxed),
            scan_truncated: self.scan_truncated.load(Ordering::Relaxed),
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            degraded_ops: self.degraded_ops.load(Ordering::Relaxed),
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let hits =
            self.local_hits.load(Ordering::Relaxed) + self.remote_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
