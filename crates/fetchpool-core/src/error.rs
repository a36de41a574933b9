use std::path::PathBuf;

use thiserror::Error;

use crate::ids::TaskId;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Submission rejected before enqueueing; the payload shape is not
    /// something an executor could interpret.
    #[error("invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// A worker reported a result for a task it does not currently own,
    /// or for a task that is not in flight. Indicates a logic bug or a
    /// duplicate report; never retried.
    #[error("task {task} is not owned by worker {worker}")]
    Ownership { task: TaskId, worker: usize },

    #[error("pool is not running")]
    PoolNotRunning,

    #[error("pool startup failed: {0}")]
    Startup(String),

    #[error("profile limit exceeded (max_profiles={limit})")]
    ProfileLimitExceeded { limit: usize },

    #[error("failed to clone profile into {path}: {source}")]
    CloneError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to export monitor data to {path}: {source}")]
    Export {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
