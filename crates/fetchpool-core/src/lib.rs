//! fetchpool-core
//!
//! A persistent worker pool for document-download pipelines. Workers
//! start once, each with its own cloned execution context, and serve
//! tasks from a shared priority queue until shutdown.
//!
//! # Module layout
//! - **queue**: task records, priority/FIFO ordering, retry scheduling
//! - **pool**: the `PersistentWorkerPool` lifecycle (start/submit/wait/shutdown)
//! - **worker**: the per-worker loop (lease, execute, report, crash recovery)
//! - **profile**: cloned execution contexts and their cleanup
//! - **monitor**: interval host sampling, per-worker counters, export
//! - **assess**: pre-start safe-worker-count assessment
//! - **executor**: the `TaskExecutor` trait callers implement

pub mod assess;
pub mod config;
pub mod error;
pub mod executor;
pub mod handle;
pub mod ids;
pub mod monitor;
pub mod pool;
pub mod profile;
pub mod queue;
pub mod worker;

pub use assess::{AssessmentReport, RiskLevel, SystemResources};
pub use config::PoolConfig;
pub use error::PoolError;
pub use executor::{ExecError, TaskExecutor};
pub use handle::TaskHandle;
pub use ids::{ProfileId, TaskId};
pub use monitor::{MonitorConfig, MonitorStatus, ResourceMonitor, WorkerMetrics};
pub use pool::{PersistentWorkerPool, PoolStatus};
pub use profile::{ExecutionContext, ProfileManager};
pub use queue::{
    FailureReason, QueueStatus, RetryPolicy, TaskError, TaskPayload, TaskQueue, TaskStatus,
    TaskView,
};
pub use worker::{WorkerSnapshot, WorkerState};
