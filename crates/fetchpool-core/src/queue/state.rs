//! Task state machine.

use serde::{Deserialize, Serialize};

/// Task status.
///
/// Transitions:
/// - Pending -> Assigned -> Running -> Completed
/// - Pending -> Assigned -> Running -> Retrying -> Pending (loop until the
///   retry budget is exhausted)
/// - Pending -> Assigned -> Running -> Failed (budget exhausted, or
///   abandoned at shutdown)
///
/// An `Assigned` task that never reaches `Running` (worker died between
/// lease and start) is reclaimed by the timeout sweep like any other
/// stale task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Eligible for dispatch.
    Pending,

    /// Leased to a worker, execution not yet confirmed.
    Assigned,

    /// Being executed by its owning worker.
    Running,

    /// Failed, waiting out the retry backoff before re-entering Pending.
    Retrying,

    /// Finished successfully; result stored until collected or evicted.
    Completed,

    /// Failed permanently.
    Failed,
}

impl TaskStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Live states count against `wait_for_completion`.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    /// States in which exactly one worker owns the task.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

/// Why a task attempt failed. Timeouts and shutdown abandonment are
/// recorded distinctly so operators can tell them apart from business
/// failures, but the retry policy treats Error and Timeout identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The executor returned an error.
    Error,

    /// The task exceeded its wall-clock budget.
    Timeout,

    /// The pool shut down while the task was in flight. Never retried.
    Shutdown,
}

/// Last recorded failure for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub reason: FailureReason,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
    }

    #[test]
    fn in_flight_states_have_an_owner() {
        assert!(TaskStatus::Assigned.is_in_flight());
        assert!(TaskStatus::Running.is_in_flight());
        assert!(!TaskStatus::Pending.is_in_flight());
        assert!(!TaskStatus::Completed.is_in_flight());
    }
}
