//! Pool configuration.
//!
//! One explicit object, constructed by the caller and passed by value
//! into the pool at construction time. No ambient globals.

use std::path::PathBuf;
use std::time::Duration;

use crate::monitor::MonitorConfig;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Desired parallelism. The resource assessor may throttle this at
    /// startup when `assess_resources` is set.
    pub worker_count: usize,

    /// Passed through to execution contexts, not interpreted here.
    pub headless_mode: bool,

    /// Template cloned once per worker.
    pub base_profile_path: PathBuf,

    /// Where per-worker clones are created.
    pub clone_root: PathBuf,

    /// Ceiling on concurrent profile clones.
    pub max_profiles: usize,

    /// Host memory-use fraction (0-1) at which workers stop pulling new
    /// tasks until pressure subsides.
    pub memory_threshold: f64,

    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,

    pub task_timeout_default: Duration,
    pub max_retries_default: u32,

    /// Consult the resource assessor during `start()`.
    pub assess_resources: bool,

    /// RAM the assessor keeps off-limits when sizing the pool.
    pub min_free_ram: u64,

    /// Restart budget for a crashed worker before it is left down.
    pub max_worker_restarts: u32,

    /// How often the pool drives the queue's timeout sweep.
    pub sweep_interval: Duration,

    /// Bounded wait between dispatch checks on an idle or throttled
    /// worker; also the upper bound on shutdown reaction time.
    pub idle_poll_interval: Duration,

    /// How long uncollected terminal results are retained.
    pub completed_retention: Duration,

    pub retry: RetryPolicy,
    pub monitor: MonitorConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            headless_mode: true,
            base_profile_path: PathBuf::from("base_profile"),
            clone_root: std::env::temp_dir().join("fetchpool-profiles"),
            max_profiles: 8,
            memory_threshold: 0.85,
            startup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            task_timeout_default: Duration::from_secs(120),
            max_retries_default: 3,
            assess_resources: true,
            min_free_ram: 1024 * 1024 * 1024,
            max_worker_restarts: 2,
            sweep_interval: Duration::from_millis(500),
            idle_poll_interval: Duration::from_millis(200),
            completed_retention: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            monitor: MonitorConfig::default(),
        }
    }
}
