//! Task record: payload plus scheduling metadata.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::state::{FailureReason, TaskError, TaskStatus};
use crate::ids::TaskId;

/// Payload handed to the external executor: string keys to JSON values.
/// The executor interprets it; the queue only stores it.
pub type TaskPayload = serde_json::Map<String, Value>;

/// Single source of truth for one task's state.
///
/// Design:
/// - The queue's ready/scheduled structures hold ids only.
/// - All state transitions happen through methods here, so the
///   invariants (owner set iff in flight, timestamps monotonic) live in
///   one place.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub priority: i32,

    /// Submission sequence, used as the FIFO tie-break within a priority.
    /// A retried task receives a fresh sequence and competes like a new
    /// submission.
    pub seq: u64,

    pub status: TaskStatus,

    /// Completed retry cycles. A task that succeeds on its first attempt
    /// finishes with `retries == 0`.
    pub retries: u32,
    pub max_retries: u32,

    /// Wall-clock budget for one attempt, measured from assignment.
    pub timeout: Duration,

    /// Worker currently holding the task. Set on assignment, cleared on
    /// requeue.
    pub owner: Option<usize>,

    pub result: Option<Value>,
    pub last_error: Option<TaskError>,

    /// When a retrying task becomes eligible again.
    pub eligible_at: Option<Instant>,

    pub created_at: Instant,
    pub assigned_at: Option<Instant>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        payload: TaskPayload,
        priority: i32,
        seq: u64,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            payload,
            priority,
            seq,
            status: TaskStatus::Pending,
            retries: 0,
            max_retries,
            timeout,
            owner: None,
            result: None,
            last_error: None,
            eligible_at: None,
            created_at: Instant::now(),
            assigned_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Pending -> Assigned.
    pub fn assign(&mut self, worker_id: usize, now: Instant) {
        self.status = TaskStatus::Assigned;
        self.owner = Some(worker_id);
        self.assigned_at = Some(now);
    }

    /// Assigned -> Running.
    pub fn start(&mut self, now: Instant) {
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
    }

    /// -> Completed.
    pub fn complete(&mut self, result: Value, now: Instant) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.finished_at = Some(now);
    }

    /// -> Failed (budget exhausted or abandoned).
    pub fn fail(&mut self, error: TaskError, now: Instant) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error);
        self.owner = None;
        self.finished_at = Some(now);
    }

    /// -> Retrying, eligible again at `eligible_at`.
    pub fn schedule_retry(&mut self, error: TaskError, eligible_at: Instant) {
        self.status = TaskStatus::Retrying;
        self.retries += 1;
        self.last_error = Some(error);
        self.owner = None;
        self.assigned_at = None;
        self.started_at = None;
        self.eligible_at = Some(eligible_at);
    }

    /// Retrying -> Pending with a fresh FIFO sequence.
    pub fn requeue(&mut self, seq: u64) {
        self.status = TaskStatus::Pending;
        self.seq = seq;
        self.eligible_at = None;
    }

    /// Deadline after which an in-flight task is considered stale.
    /// Measured from assignment so a task stuck in `Assigned` is also
    /// reclaimed.
    pub fn deadline(&self) -> Option<Instant> {
        self.assigned_at.map(|at| at + self.timeout)
    }

    /// Whether more retries remain after a failure.
    pub fn has_retry_budget(&self) -> bool {
        self.retries < self.max_retries
    }
}

/// Read-only snapshot of a task, handed out to callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub status: TaskStatus,
    pub priority: i32,
    pub retries: u32,
    pub max_retries: u32,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
}

impl TaskView {
    pub(crate) fn of(record: &TaskRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            priority: record.priority,
            retries: record.retries,
            max_retries: record.max_retries,
            result: record.result.clone(),
            error: record.last_error.clone(),
        }
    }
}

/// What a worker receives from `get_next_task`: everything needed to run
/// one attempt, detached from the queue's internal record.
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub priority: i32,

    /// 1-indexed attempt number.
    pub attempt: u32,

    pub timeout: Duration,
}
