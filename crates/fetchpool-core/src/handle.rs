//! Task handle: the submitter's capability to observe one task.

use std::sync::Arc;
use std::time::Duration;

use crate::ids::TaskId;
use crate::queue::{TaskQueue, TaskStatus, TaskView};

/// Returned by `submit_task`. Carries the task id and enough of a
/// reference to query status or block for the result. It does not own
/// the task; dropping a handle changes nothing.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    queue: Arc<TaskQueue>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, queue: Arc<TaskQueue>) -> Self {
        Self { id, queue }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current status, or `None` once the task has been evicted.
    pub async fn status(&self) -> Option<TaskStatus> {
        self.queue.view(self.id).await.map(|v| v.status)
    }

    /// Full snapshot without consuming the result.
    pub async fn view(&self) -> Option<TaskView> {
        self.queue.view(self.id).await
    }

    /// Block until the task reaches a terminal state, up to `timeout`.
    /// `None` on timeout or if the task was evicted first.
    pub async fn wait(&self, timeout: Duration) -> Option<TaskView> {
        tokio::time::timeout(timeout, self.queue.wait_terminal(self.id))
            .await
            .ok()
            .flatten()
    }

    /// Collect a terminal result, evicting the task from the queue.
    /// `None` while the task is still live.
    pub async fn collect(&self) -> Option<TaskView> {
        self.queue.collect(self.id).await
    }
}
