//! Task queue: priority dispatch, retry and timeout bookkeeping.
//!
//! Design:
//! - The queue is passive. Workers call `get_next_task`/`report_result`;
//!   the pool drives `sweep_timeouts`/`evict_expired` on its interval.
//!   Nothing in here spawns background work, which keeps it testable.
//! - Retries and timeouts are queue-owned, not worker-owned: a crashed
//!   worker leaves no orphaned task, the sweep reclaims it.
//! - Dispatch order is priority (higher first), then submission order
//!   within a priority, so tests get deterministic ordering.

mod record;
mod retry;
mod state;

pub use record::{LeasedTask, TaskPayload, TaskRecord, TaskView};
pub use retry::RetryPolicy;
pub use state::{FailureReason, TaskError, TaskStatus};

use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::PoolError;
use crate::ids::TaskId;

/// Ready-heap entry. Max-heap: highest priority first, then lowest
/// sequence (earliest submission) within a priority.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    id: TaskId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Scheduled-heap entry for retry backoff. Reverse ordering so the
/// BinaryHeap acts as a min-heap (earliest eligibility first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledEntry {
    eligible_at: Instant,
    id: TaskId,
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.eligible_at.cmp(&self.eligible_at)
    }
}

struct QueueState {
    /// All live task records (single source of truth).
    records: HashMap<TaskId, TaskRecord>,

    /// Pending tasks, ordered for dispatch.
    ready: BinaryHeap<ReadyEntry>,

    /// Retrying tasks waiting out their backoff.
    scheduled: BinaryHeap<ScheduledEntry>,

    /// Next submission sequence.
    next_seq: u64,
}

/// Consistent snapshot of queue counts. `retrying` is its own bucket so
/// the buckets always sum to `total` (live tasks); collected or
/// retention-evicted tasks leave `total`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub retrying: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl QueueStatus {
    /// No work left outstanding.
    pub fn is_idle(&self) -> bool {
        self.pending + self.retrying + self.assigned + self.running == 0
    }
}

/// Thread-safe ordered store of tasks.
pub struct TaskQueue {
    state: Mutex<QueueState>,

    /// Wakes one idle worker when work may be available.
    work: Notify,

    /// Wakes status waiters (`wait_idle`, `wait_terminal`) on any change.
    changed: Notify,

    retry: RetryPolicy,
    max_retries_default: u32,
    timeout_default: Duration,
    retention: Duration,
}

impl TaskQueue {
    pub fn new(
        retry: RetryPolicy,
        max_retries_default: u32,
        timeout_default: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                records: HashMap::new(),
                ready: BinaryHeap::new(),
                scheduled: BinaryHeap::new(),
                next_seq: 0,
            }),
            work: Notify::new(),
            changed: Notify::new(),
            retry,
            max_retries_default,
            timeout_default,
            retention,
        }
    }

    /// Enqueue a new task with queue defaults for timeout and retries.
    pub async fn add_task(&self, payload: TaskPayload, priority: i32) -> Result<TaskId, PoolError> {
        self.add_task_with(payload, priority, None, None).await
    }

    /// Enqueue with per-task overrides. Never blocks on workers.
    pub async fn add_task_with(
        &self,
        payload: TaskPayload,
        priority: i32,
        timeout: Option<Duration>,
        max_retries: Option<u32>,
    ) -> Result<TaskId, PoolError> {
        validate_payload(&payload)?;

        let id = TaskId::generate();
        {
            let mut s = self.state.lock().await;
            let seq = s.next_seq;
            s.next_seq += 1;
            let record = TaskRecord::new(
                id,
                payload,
                priority,
                seq,
                timeout.unwrap_or(self.timeout_default),
                max_retries.unwrap_or(self.max_retries_default),
            );
            s.records.insert(id, record);
            s.ready.push(ReadyEntry { priority, seq, id });
        }
        self.work.notify_one();
        self.changed.notify_waiters();
        Ok(id)
    }

    /// Atomically take the highest-priority pending task for `worker_id`.
    /// Returns `None` when nothing is eligible; never blocks.
    pub async fn get_next_task(&self, worker_id: usize) -> Option<LeasedTask> {
        let now = Instant::now();
        let lease = {
            let mut s = self.state.lock().await;
            Self::promote_scheduled(&mut s, now);

            loop {
                let entry = s.ready.pop()?;
                let Some(record) = s.records.get_mut(&entry.id) else {
                    continue; // stale entry for an evicted task
                };
                if record.status != TaskStatus::Pending || record.seq != entry.seq {
                    continue;
                }
                record.assign(worker_id, now);
                break LeasedTask {
                    id: record.id,
                    payload: record.payload.clone(),
                    priority: record.priority,
                    attempt: record.retries + 1,
                    timeout: record.timeout,
                };
            }
        };
        self.changed.notify_waiters();
        Some(lease)
    }

    /// Confirm execution has begun. Ownership-checked so the
    /// `Running implies owner + started_at` invariant holds.
    pub async fn mark_started(&self, id: TaskId, worker_id: usize) -> Result<(), PoolError> {
        {
            let mut s = self.state.lock().await;
            let record = s.records.get_mut(&id).ok_or(PoolError::UnknownTask(id))?;
            if record.status != TaskStatus::Assigned || record.owner != Some(worker_id) {
                return Err(PoolError::Ownership {
                    task: id,
                    worker: worker_id,
                });
            }
            record.start(Instant::now());
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Report the outcome of one attempt. Success stores the result;
    /// failure funnels through the retry policy. Rejected with
    /// `Ownership` when the task is not in flight under `worker_id`.
    pub async fn report_result(
        &self,
        id: TaskId,
        worker_id: usize,
        outcome: Result<Value, TaskError>,
    ) -> Result<(), PoolError> {
        let now = Instant::now();
        {
            let mut s = self.state.lock().await;
            let record = s.records.get_mut(&id).ok_or(PoolError::UnknownTask(id))?;
            if !record.status.is_in_flight() || record.owner != Some(worker_id) {
                return Err(PoolError::Ownership {
                    task: id,
                    worker: worker_id,
                });
            }
            match outcome {
                Ok(result) => record.complete(result, now),
                Err(error) => self.fail_locked(&mut s, id, error, now),
            }
        }
        self.changed.notify_waiters();
        self.work.notify_one();
        Ok(())
    }

    /// Reclaim in-flight tasks whose deadline has passed, funneling each
    /// through the same retry path as a reported failure. Driven by the
    /// pool's sweep interval.
    pub async fn sweep_timeouts(&self, now: Instant) -> usize {
        let reclaimed = {
            let mut s = self.state.lock().await;
            Self::promote_scheduled(&mut s, now);

            let stale: Vec<TaskId> = s
                .records
                .values()
                .filter(|r| r.status.is_in_flight() && r.deadline().is_some_and(|d| d <= now))
                .map(|r| r.id)
                .collect();
            for id in &stale {
                self.fail_locked(
                    &mut s,
                    *id,
                    TaskError {
                        reason: FailureReason::Timeout,
                        message: "task exceeded its wall-clock budget".into(),
                    },
                    now,
                );
            }
            stale.len()
        };
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "timeout sweep reclaimed stale tasks");
            self.changed.notify_waiters();
        }
        self.work.notify_one();
        reclaimed
    }

    /// Drop terminal records older than the retention window. Records a
    /// caller has already collected are gone before this runs.
    pub async fn evict_expired(&self, now: Instant) -> usize {
        let evicted = {
            let mut s = self.state.lock().await;
            let before = s.records.len();
            let retention = self.retention;
            s.records.retain(|_, r| {
                !(r.status.is_terminal()
                    && r.finished_at.is_some_and(|at| at + retention <= now))
            });
            before - s.records.len()
        };
        if evicted > 0 {
            self.changed.notify_waiters();
        }
        evicted
    }

    /// Force-fail every in-flight task (pool shutdown timed out).
    /// Bypasses the retry policy; reason is recorded as `Shutdown`.
    pub async fn abandon_inflight(&self) -> usize {
        let now = Instant::now();
        let abandoned = {
            let mut s = self.state.lock().await;
            let mut n = 0;
            for record in s.records.values_mut() {
                if record.status.is_in_flight() {
                    record.fail(
                        TaskError {
                            reason: FailureReason::Shutdown,
                            message: "pool shut down while task was in flight".into(),
                        },
                        now,
                    );
                    n += 1;
                }
            }
            n
        };
        if abandoned > 0 {
            self.changed.notify_waiters();
        }
        abandoned
    }

    /// Consistent counts snapshot.
    pub async fn status(&self) -> QueueStatus {
        let s = self.state.lock().await;
        let mut counts = QueueStatus::default();
        for record in s.records.values() {
            match record.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Retrying => counts.retrying += 1,
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
            counts.total += 1;
        }
        counts
    }

    /// Snapshot of one task, if still live.
    pub async fn view(&self, id: TaskId) -> Option<TaskView> {
        let s = self.state.lock().await;
        s.records.get(&id).map(TaskView::of)
    }

    /// Collect a terminal task's result, evicting the record. Returns
    /// `None` (and keeps the record) while the task is still live.
    pub async fn collect(&self, id: TaskId) -> Option<TaskView> {
        let view = {
            let mut s = self.state.lock().await;
            if !s.records.get(&id)?.status.is_terminal() {
                return None;
            }
            s.records.remove(&id).map(|r| TaskView::of(&r))
        };
        self.changed.notify_waiters();
        view
    }

    /// Suspend until a notification that work may be available. Callers
    /// must re-check `get_next_task`; wakeups are advisory.
    pub async fn wait_for_work(&self) {
        self.work.notified().await;
    }

    /// Suspend until no pending/retrying/assigned/running task remains.
    /// Safe under concurrent submission: a task submitted mid-wait is
    /// waited upon too.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.status().await.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Suspend until the task reaches a terminal state. Returns `None`
    /// if the task is unknown or evicted before completion.
    pub async fn wait_terminal(&self, id: TaskId) -> Option<TaskView> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.view(id).await {
                None => return None,
                Some(view) if view.status.is_terminal() => return Some(view),
                Some(_) => notified.await,
            }
        }
    }

    /// Shared failure funnel for reported failures and timeout sweeps:
    /// schedule a retry while budget remains, otherwise fail permanently.
    fn fail_locked(&self, s: &mut QueueState, id: TaskId, error: TaskError, now: Instant) {
        let Some(record) = s.records.get_mut(&id) else {
            return;
        };
        if record.has_retry_budget() {
            let delay = self.retry.next_delay(record.retries + 1);
            let eligible_at = now + delay;
            record.schedule_retry(error, eligible_at);
            s.scheduled.push(ScheduledEntry { eligible_at, id });
        } else {
            record.fail(error, now);
        }
    }

    /// Move retrying tasks whose backoff has elapsed back into the ready
    /// heap with a fresh sequence, so they compete like new submissions.
    fn promote_scheduled(s: &mut QueueState, now: Instant) {
        while let Some(entry) = s.scheduled.peek() {
            if entry.eligible_at > now {
                break; // heap is sorted, nothing further is due
            }
            let entry = s.scheduled.pop().expect("peeked entry exists");
            let seq = s.next_seq;
            if let Some(record) = s.records.get_mut(&entry.id)
                && record.status == TaskStatus::Retrying
            {
                record.requeue(seq);
                s.next_seq += 1;
                s.ready.push(ReadyEntry {
                    priority: record.priority,
                    seq,
                    id: entry.id,
                });
            }
        }
    }
}

fn validate_payload(payload: &TaskPayload) -> Result<(), PoolError> {
    if payload.is_empty() {
        return Err(PoolError::InvalidPayload("payload must not be empty".into()));
    }
    if payload.keys().any(|k| k.is_empty()) {
        return Err(PoolError::InvalidPayload("payload keys must not be empty".into()));
    }
    Ok(())
}
