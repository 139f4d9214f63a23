//! Core settings and limits

use std::time::Duration;

/// Maximum registries per group and package format
pub const MAX_REGISTRY_COUNT: i64 = 20;
/// Maximum upstreams in one registry's chain
pub const MAX_UPSTREAMS_COUNT: i64 = 20;
/// Attempts for the insert-or-update cache entry loop
pub const MAX_UPSERT_ATTEMPTS: u32 = 3;
/// Attempts for appending an upstream at the next free position
pub const MAX_POSITION_ATTEMPTS: u32 = 3;
/// Attempts for jobs the queue retries on failure
pub const MAX_JOB_ATTEMPTS: u32 = 3;
/// Cadences (days) a cleanup policy may run on
pub const ALLOWED_CLEANUP_CADENCES: [i64; 5] = [1, 7, 14, 30, 90];
/// Inclusive bounds of `keep_n_days_after_download`
pub const KEEP_DAYS_RANGE: (i64, i64) = (1, 365);

/// Runtime settings the core services need.
///
/// Built by the binary from its configuration file; the core never reads
/// configuration itself.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    /// Never compute, accept or store MD5 digests
    pub restricted_cryptography: bool,
    /// Permit upstream URLs that resolve to loopback or private addresses
    pub allow_local_requests: bool,
    /// Delay between a download and the flush of its counter
    pub counter_flush_delay: Duration,
    /// Entries marked per statement during a cleanup run
    pub cleanup_batch_size: i64,
    /// Entries reclaimed per reclaim job
    pub reclaim_batch_size: i64,
    /// A run still `running` after this long is considered dead
    pub stale_cleanup_after: Duration,
    /// Delay before a failed retryable job is re-enqueued
    pub job_retry_delay: Duration,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            restricted_cryptography: false,
            allow_local_requests: false,
            counter_flush_delay: Duration::from_secs(2),
            cleanup_batch_size: 500,
            reclaim_batch_size: 100,
            stale_cleanup_after: Duration::from_secs(6 * 3600),
            job_retry_delay: Duration::from_secs(30),
        }
    }
}
