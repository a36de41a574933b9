//! The pool: owns the queue, the workers, their contexts, and the
//! monitor, and drives them through one start/run/shutdown lifecycle.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, sleep, timeout};
use tracing::{info, warn};

use crate::assess;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::executor::TaskExecutor;
use crate::handle::TaskHandle;
use crate::monitor::{MonitorStatus, ResourceMonitor};
use crate::profile::ProfileManager;
use crate::queue::{QueueStatus, TaskPayload, TaskQueue};
use crate::worker::{WorkerCell, WorkerRuntime, WorkerSnapshot, worker_loop};

/// One-way lifecycle: a stopped pool is never restarted, a fresh pool is
/// constructed instead. `Starting` reserves the pool while provisioning
/// runs outside the lock, so control calls stay prompt during a slow
/// (staggered) startup. A failed start falls back to `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolPhase {
    Created,
    Starting,
    Running,
    Stopped,
}

/// Combined snapshot for operators: queue counts, per-worker state, and
/// the latest host reading.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub queue: QueueStatus,
    pub workers: Vec<WorkerSnapshot>,
    pub resources: MonitorStatus,
}

struct PoolInner {
    phase: PoolPhase,
    cells: Vec<Arc<WorkerCell>>,
    joins: Vec<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    sweeper: Option<JoinHandle<()>>,
}

/// Everything a successful launch produces, installed under the lock in
/// one step.
struct LaunchedWorkers {
    cells: Vec<Arc<WorkerCell>>,
    joins: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: JoinHandle<()>,
}

/// A persistent worker pool over a single executor.
///
/// Workers outlive individual tasks: each starts once with its own
/// cloned execution context and then serves tasks until shutdown, so
/// per-task startup cost is paid once per worker.
pub struct PersistentWorkerPool {
    config: PoolConfig,
    queue: Arc<TaskQueue>,
    profiles: Arc<ProfileManager>,
    monitor: Arc<ResourceMonitor>,
    executor: Arc<dyn TaskExecutor>,
    inner: Mutex<PoolInner>,
}

impl PersistentWorkerPool {
    pub fn new(config: PoolConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        let queue = Arc::new(TaskQueue::new(
            config.retry.clone(),
            config.max_retries_default,
            config.task_timeout_default,
            config.completed_retention,
        ));
        let profiles = Arc::new(ProfileManager::new(
            config.base_profile_path.clone(),
            config.clone_root.clone(),
            config.max_profiles,
            config.headless_mode,
        ));
        let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone()));
        Self {
            config,
            queue,
            profiles,
            monitor,
            executor,
            inner: Mutex::new(PoolInner {
                phase: PoolPhase::Created,
                cells: Vec::new(),
                joins: Vec::new(),
                shutdown_tx: None,
                sweeper: None,
            }),
        }
    }

    /// Bring the pool up: assess the host, provision one context per
    /// worker (all-or-nothing), then launch the workers and the timeout
    /// sweeper. Fails without side effects left behind; a failed start
    /// leaves the pool startable again.
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.phase {
                PoolPhase::Created => inner.phase = PoolPhase::Starting,
                PoolPhase::Starting | PoolPhase::Running => {
                    return Err(PoolError::Startup("pool is already running".into()));
                }
                PoolPhase::Stopped => {
                    return Err(PoolError::Startup(
                        "pool has been shut down and cannot be restarted".into(),
                    ));
                }
            }
        }

        // Provisioning and the staggered spawn can take seconds; the
        // lock is not held across them so status and submission calls
        // get a prompt answer instead of queueing behind startup.
        let launched = match self.launch().await {
            Ok(launched) => launched,
            Err(e) => {
                self.inner.lock().await.phase = PoolPhase::Created;
                return Err(e);
            }
        };

        let workers = launched.cells.len();
        let mut inner = self.inner.lock().await;
        inner.phase = PoolPhase::Running;
        inner.cells = launched.cells;
        inner.joins = launched.joins;
        inner.shutdown_tx = Some(launched.shutdown_tx);
        inner.sweeper = Some(launched.sweeper);
        info!(workers, "worker pool started");
        Ok(())
    }

    async fn launch(&self) -> Result<LaunchedWorkers, PoolError> {
        let mut count = self.config.worker_count.max(1);
        let mut stagger = Duration::ZERO;
        if self.config.assess_resources {
            let requested = count;
            let min_free = self.config.min_free_ram;
            // The sysinfo read blocks on the CPU sampling interval.
            let (suggested, report) =
                tokio::task::spawn_blocking(move || {
                    assess::calculate_safe_worker_count(requested, min_free)
                })
                .await
                .map_err(|e| PoolError::Startup(format!("resource assessment failed: {e}")))?;
            info!("{}", assess::get_risk_message(&report));
            if report.throttled {
                warn!(requested, suggested, "worker count throttled by resource assessment");
            }
            count = suggested.max(1);
            stagger = report.stagger_delay;
        }

        let contexts = {
            let profiles = Arc::clone(&self.profiles);
            let provision = tokio::task::spawn_blocking(move || {
                let mut contexts = Vec::with_capacity(count);
                for worker_id in 0..count {
                    contexts.push(profiles.create_profile(worker_id)?);
                }
                Ok::<_, PoolError>(contexts)
            });
            match timeout(self.config.startup_timeout, provision).await {
                Ok(Ok(Ok(contexts))) => contexts,
                Ok(Ok(Err(e))) => {
                    self.profiles.cleanup_all_profiles();
                    return Err(PoolError::Startup(format!(
                        "context provisioning failed: {e}"
                    )));
                }
                Ok(Err(join_err)) => {
                    self.profiles.cleanup_all_profiles();
                    return Err(PoolError::Startup(format!(
                        "context provisioning panicked: {join_err}"
                    )));
                }
                Err(_) => {
                    self.profiles.cleanup_all_profiles();
                    return Err(PoolError::Startup("context provisioning timed out".into()));
                }
            }
        };

        self.monitor.start_monitoring();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runtime = Arc::new(WorkerRuntime {
            queue: Arc::clone(&self.queue),
            executor: Arc::clone(&self.executor),
            monitor: Arc::clone(&self.monitor),
            profiles: Arc::clone(&self.profiles),
            config: self.config.clone(),
        });

        let mut cells = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);
        for ctx in contexts {
            let worker_id = ctx.worker_id;
            if worker_id > 0 && !stagger.is_zero() {
                sleep(stagger).await;
            }
            self.monitor.register_worker(worker_id).await;
            let cell = Arc::new(WorkerCell::new(worker_id));
            let join = tokio::spawn(worker_loop(
                Arc::clone(&cell),
                Arc::clone(&runtime),
                ctx,
                shutdown_rx.clone(),
            ));
            cells.push(cell);
            joins.push(join);
        }

        // The sweep is driven here rather than inside the queue so the
        // queue stays passive and deterministic under test.
        let sweeper = {
            let queue = Arc::clone(&self.queue);
            let mut rx = shutdown_rx;
            let period = self.config.sweep_interval;
            tokio::spawn(async move {
                let mut tick = interval(period);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let now = Instant::now();
                            queue.sweep_timeouts(now).await;
                            queue.evict_expired(now).await;
                        }
                        _ = rx.changed() => {
                            if *rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        Ok(LaunchedWorkers {
            cells,
            joins,
            shutdown_tx,
            sweeper,
        })
    }

    /// Enqueue a task. Returns immediately with a handle; never blocks
    /// on worker availability.
    pub async fn submit_task(
        &self,
        payload: TaskPayload,
        priority: i32,
    ) -> Result<TaskHandle, PoolError> {
        self.ensure_running().await?;
        let id = self.queue.add_task(payload, priority).await?;
        Ok(TaskHandle::new(id, Arc::clone(&self.queue)))
    }

    /// Enqueue with per-task timeout and retry overrides.
    pub async fn submit_task_with(
        &self,
        payload: TaskPayload,
        priority: i32,
        task_timeout: Option<Duration>,
        max_retries: Option<u32>,
    ) -> Result<TaskHandle, PoolError> {
        self.ensure_running().await?;
        let id = self
            .queue
            .add_task_with(payload, priority, task_timeout, max_retries)
            .await?;
        Ok(TaskHandle::new(id, Arc::clone(&self.queue)))
    }

    /// Enqueue a batch in order; handles come back in submission order.
    pub async fn submit_tasks(
        &self,
        batch: Vec<(TaskPayload, i32)>,
    ) -> Result<Vec<TaskHandle>, PoolError> {
        self.ensure_running().await?;
        let mut handles = Vec::with_capacity(batch.len());
        for (payload, priority) in batch {
            let id = self.queue.add_task(payload, priority).await?;
            handles.push(TaskHandle::new(id, Arc::clone(&self.queue)));
        }
        Ok(handles)
    }

    /// Block until every submitted task is terminal, up to `wait`.
    /// Returns `true` if the queue drained, `false` on timeout.
    pub async fn wait_for_completion(&self, wait: Duration) -> Result<bool, PoolError> {
        self.ensure_running().await?;
        Ok(timeout(wait, self.queue.wait_idle()).await.is_ok())
    }

    /// Consistent point-in-time snapshot of queue, workers, and host.
    pub async fn get_status(&self) -> PoolStatus {
        let workers = {
            let inner = self.inner.lock().await;
            inner.cells.iter().map(|c| c.snapshot()).collect()
        };
        PoolStatus {
            queue: self.queue.status().await,
            workers,
            resources: self.monitor.get_current_status().await,
        }
    }

    /// Graceful stop: signal workers, wait up to `grace` for in-flight
    /// tasks, then abort stragglers and mark their tasks failed. Always
    /// reclaims contexts and stops the monitor. Idempotent.
    ///
    /// Returns `true` when every worker drained within the grace period,
    /// `false` when the grace elapsed and in-flight work was abandoned.
    pub async fn shutdown(&self, grace: Duration) -> Result<bool, PoolError> {
        let (joins, sweeper) = {
            let mut inner = self.inner.lock().await;
            if inner.phase != PoolPhase::Running {
                return Ok(true);
            }
            inner.phase = PoolPhase::Stopped;
            if let Some(tx) = inner.shutdown_tx.take() {
                let _ = tx.send(true);
            }
            (std::mem::take(&mut inner.joins), inner.sweeper.take())
        };
        info!(workers = joins.len(), "worker pool shutting down");

        let mut joins = joins;
        let mut drained_in_time = true;
        let drained = async {
            for join in joins.iter_mut() {
                let _ = join.await;
            }
        };
        if timeout(grace, drained).await.is_err() {
            drained_in_time = false;
            warn!("shutdown grace period elapsed; aborting remaining workers");
            for join in &joins {
                join.abort();
            }
            let abandoned = self.queue.abandon_inflight().await;
            if abandoned > 0 {
                warn!(abandoned, "in-flight tasks abandoned at shutdown");
            }
            let inner = self.inner.lock().await;
            for cell in &inner.cells {
                cell.mark_stopped_if_alive();
            }
        }

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        self.monitor.stop_monitoring().await;
        let profiles = Arc::clone(&self.profiles);
        let _ = tokio::task::spawn_blocking(move || profiles.cleanup_all_profiles()).await;
        info!(drained_in_time, "worker pool stopped");
        Ok(drained_in_time)
    }

    /// The monitor, for history export.
    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    async fn ensure_running(&self) -> Result<(), PoolError> {
        let inner = self.inner.lock().await;
        if inner.phase != PoolPhase::Running {
            return Err(PoolError::PoolNotRunning);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::executor::ExecError;
    use crate::profile::ExecutionContext;
    use crate::queue::{FailureReason, RetryPolicy, TaskStatus};
    use crate::worker::WorkerState;

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(
            &self,
            payload: TaskPayload,
            _context: ExecutionContext,
        ) -> Result<Value, ExecError> {
            Ok(Value::Object(payload))
        }
    }

    struct AlwaysFail;

    #[async_trait]
    impl TaskExecutor for AlwaysFail {
        async fn execute(
            &self,
            _payload: TaskPayload,
            _context: ExecutionContext,
        ) -> Result<Value, ExecError> {
            Err("download refused".into())
        }
    }

    /// Fails the first `failures` attempts across all tasks, then echoes.
    struct FailFirst {
        remaining: AtomicU32,
    }

    #[async_trait]
    impl TaskExecutor for FailFirst {
        async fn execute(
            &self,
            payload: TaskPayload,
            _context: ExecutionContext,
        ) -> Result<Value, ExecError> {
            let before = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .unwrap_or(0);
            if before > 0 {
                Err("transient network error".into())
            } else {
                Ok(Value::Object(payload))
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl TaskExecutor for Panicking {
        async fn execute(
            &self,
            _payload: TaskPayload,
            _context: ExecutionContext,
        ) -> Result<Value, ExecError> {
            panic!("browser session died");
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl TaskExecutor for Slow {
        async fn execute(
            &self,
            payload: TaskPayload,
            _context: ExecutionContext,
        ) -> Result<Value, ExecError> {
            tokio::time::sleep(self.0).await;
            Ok(Value::Object(payload))
        }
    }

    fn payload(url: &str) -> TaskPayload {
        let mut map = TaskPayload::new();
        map.insert("url".into(), json!(url));
        map
    }

    fn template() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("session.json"), b"{}").unwrap();
        dir
    }

    fn test_config(base: &Path, root: &Path, workers: usize) -> PoolConfig {
        PoolConfig {
            worker_count: workers,
            base_profile_path: base.to_path_buf(),
            clone_root: root.to_path_buf(),
            max_profiles: workers + 2,
            assess_resources: false,
            task_timeout_default: Duration::from_secs(5),
            max_retries_default: 0,
            sweep_interval: Duration::from_millis(25),
            idle_poll_interval: Duration::from_millis(25),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                ..RetryPolicy::default()
            }
            .without_jitter(),
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn tasks_run_to_completion_across_workers() {
        let base = template();
        let root = tempfile::tempdir().unwrap();
        let pool = PersistentWorkerPool::new(
            test_config(base.path(), root.path(), 2),
            Arc::new(Echo),
        );
        pool.start().await.unwrap();

        let batch = (0..5)
            .map(|i| (payload(&format!("https://example.com/doc/{i}")), i))
            .collect();
        let handles = pool.submit_tasks(batch).await.unwrap();
        assert!(pool.wait_for_completion(Duration::from_secs(5)).await.unwrap());

        for (i, handle) in handles.iter().enumerate() {
            let view = handle.collect().await.expect("terminal result retained");
            assert_eq!(view.status, TaskStatus::Completed);
            let result = view.result.expect("completed task has a result");
            assert_eq!(
                result["url"],
                format!("https://example.com/doc/{i}")
            );
        }

        let status = pool.get_status().await;
        assert_eq!(status.queue.total, 0);
        assert_eq!(status.workers.len(), 2);
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let base = template();
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(base.path(), root.path(), 1);
        config.max_retries_default = 3;
        let pool = PersistentWorkerPool::new(
            config,
            Arc::new(FailFirst {
                remaining: AtomicU32::new(2),
            }),
        );
        pool.start().await.unwrap();

        let handle = pool
            .submit_task(payload("https://example.com/flaky"), 0)
            .await
            .unwrap();
        let view = handle.wait(Duration::from_secs(10)).await.expect("terminal");
        assert_eq!(view.status, TaskStatus::Completed);
        assert_eq!(view.retries, 2);
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_leave_failed_tasks_queryable() {
        let base = template();
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(base.path(), root.path(), 1);
        config.max_retries_default = 2;
        let pool = PersistentWorkerPool::new(config, Arc::new(AlwaysFail));
        pool.start().await.unwrap();

        let handles = pool
            .submit_tasks(vec![
                (payload("https://example.com/a"), 0),
                (payload("https://example.com/b"), 0),
                (payload("https://example.com/c"), 0),
            ])
            .await
            .unwrap();
        assert!(pool.wait_for_completion(Duration::from_secs(10)).await.unwrap());

        let status = pool.get_status().await;
        assert_eq!(status.queue.failed, 3);
        assert!(status.queue.is_idle());

        for handle in &handles {
            let view = handle.view().await.expect("failed task still queryable");
            assert_eq!(view.status, TaskStatus::Failed);
            assert_eq!(view.retries, 2);
            let error = view.error.expect("failure recorded");
            assert_eq!(error.reason, FailureReason::Error);
            assert!(error.message.contains("download refused"));
        }
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn submit_requires_a_running_pool() {
        let base = template();
        let root = tempfile::tempdir().unwrap();
        let pool = PersistentWorkerPool::new(
            test_config(base.path(), root.path(), 1),
            Arc::new(Echo),
        );

        let before = pool.submit_task(payload("https://example.com"), 0).await;
        assert!(matches!(before, Err(PoolError::PoolNotRunning)));

        pool.start().await.unwrap();
        pool.shutdown(Duration::from_secs(5)).await.unwrap();

        let after = pool.submit_task(payload("https://example.com"), 0).await;
        assert!(matches!(after, Err(PoolError::PoolNotRunning)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_start_is_one_shot() {
        let base = template();
        let root = tempfile::tempdir().unwrap();
        let pool = PersistentWorkerPool::new(
            test_config(base.path(), root.path(), 1),
            Arc::new(Echo),
        );
        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(PoolError::Startup(_))));

        assert!(pool.shutdown(Duration::from_secs(5)).await.unwrap());
        // Second shutdown is a no-op that still reports a clean stop.
        assert!(pool.shutdown(Duration::from_secs(5)).await.unwrap());
        assert!(matches!(pool.start().await, Err(PoolError::Startup(_))));
    }

    #[tokio::test]
    async fn failed_start_leaves_the_pool_startable() {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().join("base-not-yet-created");
        let clones = root.path().join("clones");
        std::fs::create_dir(&clones).unwrap();

        let pool = PersistentWorkerPool::new(
            test_config(&base, &clones, 1),
            Arc::new(Echo),
        );
        assert!(matches!(pool.start().await, Err(PoolError::Startup(_))));

        // Once the template exists the same pool starts normally.
        std::fs::create_dir(&base).unwrap();
        std::fs::write(base.join("session.json"), b"{}").unwrap();
        pool.start().await.unwrap();

        let handle = pool
            .submit_task(payload("https://example.com/late"), 0)
            .await
            .unwrap();
        let view = handle.wait(Duration::from_secs(5)).await.expect("terminal");
        assert_eq!(view.status, TaskStatus::Completed);
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_completion_on_an_empty_queue_returns_immediately() {
        let base = template();
        let root = tempfile::tempdir().unwrap();
        let pool = PersistentWorkerPool::new(
            test_config(base.path(), root.path(), 1),
            Arc::new(Echo),
        );
        pool.start().await.unwrap();
        assert!(pool.wait_for_completion(Duration::from_millis(100)).await.unwrap());
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn crashed_executor_fails_the_task_without_killing_the_pool() {
        let base = template();
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(base.path(), root.path(), 1);
        config.max_retries_default = 1;
        config.task_timeout_default = Duration::from_millis(200);
        config.max_worker_restarts = 3;
        let pool = PersistentWorkerPool::new(config, Arc::new(Panicking));
        pool.start().await.unwrap();

        let handle = pool
            .submit_task(payload("https://example.com/crash"), 0)
            .await
            .unwrap();
        // The panic is never reported; the timeout sweep must reclaim
        // the task, retry it once, and fail it.
        let view = handle.wait(Duration::from_secs(10)).await.expect("terminal");
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.retries, 1);
        assert_eq!(
            view.error.expect("failure recorded").reason,
            FailureReason::Timeout
        );

        let status = pool.get_status().await;
        let worker = &status.workers[0];
        assert!(worker.restarts >= 1);
        assert!(matches!(
            worker.state,
            WorkerState::Idle | WorkerState::Crashed
        ));
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_grace_abandons_stuck_tasks() {
        let base = template();
        let root = tempfile::tempdir().unwrap();
        let pool = PersistentWorkerPool::new(
            test_config(base.path(), root.path(), 1),
            Arc::new(Slow(Duration::from_secs(30))),
        );
        pool.start().await.unwrap();

        let handle = pool
            .submit_task(payload("https://example.com/slow"), 0)
            .await
            .unwrap();
        // Let the worker pick it up before pulling the plug.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let drained = pool.shutdown(Duration::from_millis(100)).await.unwrap();
        assert!(!drained);

        let view = handle.view().await.expect("abandoned task retained");
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(
            view.error.expect("failure recorded").reason,
            FailureReason::Shutdown
        );
    }

    #[tokio::test]
    async fn shutdown_reclaims_every_profile() {
        let base = template();
        let root = tempfile::tempdir().unwrap();
        let pool = PersistentWorkerPool::new(
            test_config(base.path(), root.path(), 2),
            Arc::new(Echo),
        );
        pool.start().await.unwrap();
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 2);

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
