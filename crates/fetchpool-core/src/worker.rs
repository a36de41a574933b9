//! Worker loop: lease, execute, report.
//!
//! One long-lived tokio task per worker. The loop blocks only while
//! waiting for work (bounded, interruptible by shutdown) and while the
//! executor runs. The executor is invoked through an inner spawn so a
//! panic is contained as a worker crash instead of taking the loop
//! down, and so the task's deadline can abort it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::executor::TaskExecutor;
use crate::monitor::ResourceMonitor;
use crate::profile::{ExecutionContext, ProfileManager};
use crate::queue::{FailureReason, TaskError, TaskQueue};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Starting,
    Idle,
    Busy,
    Stopping,
    Stopped,
    Crashed,
}

/// Read-only view of one worker for `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub state: WorkerState,
    pub processed: u64,
    pub failed: u64,
    pub restarts: u32,
    pub last_heartbeat_ms: u64,
}

/// Per-worker record shared between the pool (reader) and the worker's
/// own loop (writer).
pub(crate) struct WorkerCell {
    pub id: usize,
    state: StdMutex<WorkerState>,
    processed: AtomicU64,
    failed: AtomicU64,
    restarts: AtomicU32,
    heartbeat: StdMutex<Instant>,
}

impl WorkerCell {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: StdMutex::new(WorkerState::Starting),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            restarts: AtomicU32::new(0),
            heartbeat: StdMutex::new(Instant::now()),
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().expect("worker state lock") = state;
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().expect("worker state lock")
    }

    fn beat(&self) {
        *self.heartbeat.lock().expect("worker heartbeat lock") = Instant::now();
    }

    pub fn mark_stopped_if_alive(&self) {
        let mut state = self.state.lock().expect("worker state lock");
        if *state != WorkerState::Crashed {
            *state = WorkerState::Stopped;
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            state: self.state(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            last_heartbeat_ms: self
                .heartbeat
                .lock()
                .expect("worker heartbeat lock")
                .elapsed()
                .as_millis() as u64,
        }
    }
}

/// Everything a worker loop needs, shared across all workers.
pub(crate) struct WorkerRuntime {
    pub queue: Arc<TaskQueue>,
    pub executor: Arc<dyn TaskExecutor>,
    pub monitor: Arc<ResourceMonitor>,
    pub profiles: Arc<ProfileManager>,
    pub config: PoolConfig,
}

pub(crate) async fn worker_loop(
    cell: Arc<WorkerCell>,
    rt: Arc<WorkerRuntime>,
    mut ctx: ExecutionContext,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(worker = cell.id, profile = %ctx.id, "worker started");
    cell.set_state(WorkerState::Idle);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        cell.beat();

        // Proactive throttling: over the memory threshold this worker
        // stops pulling new tasks but never drops in-flight work.
        if rt.monitor.memory_pressure().await >= rt.config.memory_threshold {
            cell.set_state(WorkerState::Idle);
            debug!(worker = cell.id, "memory pressure above threshold; pausing task intake");
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = sleep(rt.config.idle_poll_interval) => {}
            }
            continue;
        }

        let Some(task) = rt.queue.get_next_task(cell.id).await else {
            cell.set_state(WorkerState::Idle);
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = rt.queue.wait_for_work() => {}
                _ = sleep(rt.config.idle_poll_interval) => {}
            }
            continue;
        };

        cell.set_state(WorkerState::Busy);
        if let Err(e) = rt.queue.mark_started(task.id, cell.id).await {
            warn!(worker = cell.id, task = %task.id, error = %e, "lost task before start");
            continue;
        }
        debug!(worker = cell.id, task = %task.id, attempt = task.attempt, "executing task");

        let executor = Arc::clone(&rt.executor);
        let payload = task.payload.clone();
        let context = ctx.clone();
        let mut attempt = tokio::spawn(async move { executor.execute(payload, context).await });

        // The deadline is a hard cap on the attempt; the sweep would
        // reclaim the task anyway, but aborting locally frees the worker
        // immediately.
        let outcome = tokio::select! {
            res = &mut attempt => Some(res),
            _ = sleep(task.timeout) => {
                attempt.abort();
                None
            }
        };

        // Counters move only when the queue accepts the report. A
        // rejected report means the sweep already reclaimed the task and
        // accounted for the attempt; bumping here would count it twice.
        match outcome {
            Some(Ok(Ok(result))) => {
                match rt.queue.report_result(task.id, cell.id, Ok(result)).await {
                    Ok(()) => {
                        cell.processed.fetch_add(1, Ordering::Relaxed);
                        rt.monitor.update_worker_metrics(cell.id, 1, 0).await;
                    }
                    Err(e) => {
                        warn!(worker = cell.id, task = %task.id, error = %e, "result report rejected");
                    }
                }
            }
            Some(Ok(Err(err))) => {
                warn!(worker = cell.id, task = %task.id, error = %err, "task attempt failed");
                let failure = TaskError {
                    reason: FailureReason::Error,
                    message: err.to_string(),
                };
                match rt.queue.report_result(task.id, cell.id, Err(failure)).await {
                    Ok(()) => {
                        cell.failed.fetch_add(1, Ordering::Relaxed);
                        rt.monitor.update_worker_metrics(cell.id, 0, 1).await;
                    }
                    Err(e) => {
                        warn!(worker = cell.id, task = %task.id, error = %e, "failure report rejected");
                    }
                }
            }
            None => {
                warn!(worker = cell.id, task = %task.id, "task attempt timed out");
                let failure = TaskError {
                    reason: FailureReason::Timeout,
                    message: "task exceeded its wall-clock budget".into(),
                };
                match rt.queue.report_result(task.id, cell.id, Err(failure)).await {
                    Ok(()) => {
                        cell.failed.fetch_add(1, Ordering::Relaxed);
                        rt.monitor.update_worker_metrics(cell.id, 0, 1).await;
                    }
                    Err(e) => {
                        debug!(worker = cell.id, task = %task.id, error = %e, "timeout already swept");
                    }
                }
            }
            Some(Err(join_err)) => {
                // Only the timeout arm aborts, so this is a panic.
                error!(
                    worker = cell.id,
                    task = %task.id,
                    panic = join_err.is_panic(),
                    "executor crashed; entering crash recovery"
                );
                cell.set_state(WorkerState::Crashed);
                // Deliberately not reported: the timeout sweep reclaims
                // the task so a dead worker and a recovering one look
                // the same to the queue.
                let restarts = cell.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = rt.profiles.cleanup_profile(&ctx);
                if restarts > rt.config.max_worker_restarts {
                    error!(worker = cell.id, restarts, "restart budget exhausted; worker stays down");
                    rt.monitor.unregister_worker(cell.id).await;
                    return;
                }
                match rt.profiles.create_profile(cell.id) {
                    Ok(fresh) => {
                        info!(worker = cell.id, restarts, profile = %fresh.id, "worker restarted with a fresh profile");
                        ctx = fresh;
                        cell.set_state(WorkerState::Idle);
                    }
                    Err(e) => {
                        error!(worker = cell.id, error = %e, "could not refresh profile; worker stays down");
                        rt.monitor.unregister_worker(cell.id).await;
                        return;
                    }
                }
            }
        }
    }

    cell.set_state(WorkerState::Stopping);
    let _ = rt.profiles.cleanup_profile(&ctx);
    rt.monitor.unregister_worker(cell.id).await;
    cell.set_state(WorkerState::Stopped);
    info!(worker = cell.id, "worker stopped");
}
