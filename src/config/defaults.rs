//! Default constants for relcache configuration.
//!
//! All magic numbers are centralized here with documentation.

/// Stampede lock TTL in seconds. Also the upper bound on one signal wait:
/// a waiter never blocks longer than a crashed producer's lock can live.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;

/// Soft deadline for one atomic invalidation pass, in milliseconds.
/// Hitting it truncates the registration scan exactly like `max_scan`.
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 5_000;

/// Maximum registrations scanned per invalidation pass per shard.
/// Scans past this bound are skipped: a documented under-invalidation risk
/// surfaced through the `scan_truncated` metric, never an error.
pub const DEFAULT_MAX_SCAN: usize = 1_000;

/// Capacity of the process-lifetime local layer, in entries.
pub const DEFAULT_PROCESS_CAPACITY: usize = 100_000;

/// Single-node topology used when no cluster descriptor is configured.
pub fn default_cluster_nodes() -> Vec<String> {
    vec!["cache-0".to_string()]
}
