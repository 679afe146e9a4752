//! Service configuration: compile-time defaults plus the environment
//! variables read once at startup.

use std::time::Duration;

pub const REGISTRY_MAX_ENTRIES: usize = 50;
pub const REGISTRY_MAX_VULNS_PER_SCAN: usize = 10_000;
pub const QUEUE_MAX_SIZE: usize = 10;
pub const QUEUE_MAX_CONCURRENT: usize = 1;
pub const WORKER_TIMEOUT_MS: u64 = 480_000;
pub const WORKER_SHUTDOWN_GRACE_MS: u64 = 5_000;
pub const RETRY_AFTER_SECONDS: u64 = 30;
pub const CLONE_TIMEOUT_MS: u64 = 120_000;
pub const SCAN_TIMEOUT_MS: u64 = 300_000;
pub const VULN_BATCH_SIZE: usize = 50;

/// Cap on captured subprocess output (clone/scan stderr and stdout).
pub const EXEC_MAX_BUFFER: usize = 10 * 1024 * 1024;

/// Address-space cap for worker processes. Strictly below the service's
/// memory ceiling so a runaway worker hits a recoverable allocation failure
/// before the OS kills the whole service.
pub const WORKER_MEMORY_LIMIT_BYTES: u64 = 150 * 1024 * 1024;

/// Newest-bytes ring buffer for worker stderr, used for OOM classification.
pub const STDERR_RING_CAPACITY: usize = 4 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub queue_max_size: usize,
    pub queue_max_concurrent: usize,
    pub registry_max_entries: usize,
    pub registry_max_vulns_per_scan: usize,
    pub worker_timeout: Duration,
    pub shutdown_grace: Duration,
    pub retry_after: Duration,
    pub clone_timeout: Duration,
    pub scan_timeout: Duration,
    pub worker_memory_limit: Option<u64>,
}

impl Config {
    /// Read the environment once; anything unset or unparseable falls back
    /// to the compile-time default.
    pub fn from_env() -> Self {
        let config = Self {
            queue_max_size: env_usize("QUEUE_MAX_SIZE", QUEUE_MAX_SIZE),
            queue_max_concurrent: env_usize("QUEUE_MAX_CONCURRENT", QUEUE_MAX_CONCURRENT),
            registry_max_entries: REGISTRY_MAX_ENTRIES,
            registry_max_vulns_per_scan: REGISTRY_MAX_VULNS_PER_SCAN,
            worker_timeout: Duration::from_millis(WORKER_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(WORKER_SHUTDOWN_GRACE_MS),
            retry_after: Duration::from_secs(RETRY_AFTER_SECONDS),
            clone_timeout: Duration::from_millis(CLONE_TIMEOUT_MS),
            scan_timeout: Duration::from_millis(SCAN_TIMEOUT_MS),
            worker_memory_limit: Some(WORKER_MEMORY_LIMIT_BYTES),
        };

        // The worker must outlive clone + scan plus a parse margin, or the
        // manager would kill workers that are still making progress.
        debug_assert!(config.worker_timeout > config.clone_timeout + config.scan_timeout);

        config
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
