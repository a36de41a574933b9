use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use fetchpool_core::{
    ExecError, ExecutionContext, PersistentWorkerPool, PoolConfig, TaskExecutor, TaskPayload,
};

/// Demo executor: pretends to download a document, failing the first
/// few attempts to show the retry path.
struct FlakyDownloader {
    remaining_failures: AtomicU32,
}

impl FlakyDownloader {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl TaskExecutor for FlakyDownloader {
    async fn execute(
        &self,
        payload: TaskPayload,
        context: ExecutionContext,
    ) -> Result<Value, ExecError> {
        let url = payload
            .get("url")
            .and_then(Value::as_str)
            .ok_or("payload missing url")?;

        // Simulated network latency.
        let delay_ms = { rand::thread_rng().gen_range(30..120) };
        sleep(Duration::from_millis(delay_ms)).await;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(format!("connection reset fetching {url} (left={left})").into());
        }

        Ok(json!({
            "url": url,
            "bytes": delay_ms * 1024,
            "worker": context.worker_id,
            "profile": context.id.to_string(),
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // (A) A throwaway base profile for the demo.
    let base = tempfile::tempdir()?;
    std::fs::write(base.path().join("session.json"), b"{}")?;
    let clone_root = tempfile::tempdir()?;

    let config = PoolConfig {
        worker_count: 3,
        base_profile_path: base.path().to_path_buf(),
        clone_root: clone_root.path().to_path_buf(),
        task_timeout_default: Duration::from_secs(10),
        max_retries_default: 3,
        ..PoolConfig::default()
    };

    // (B) Bring the pool up; the assessor may throttle the worker count.
    let pool = PersistentWorkerPool::new(config, Arc::new(FlakyDownloader::new(4)));
    pool.start().await?;

    // (C) Submit a batch; higher priority is dispatched first.
    let batch = (0..10)
        .map(|i| {
            let mut payload = TaskPayload::new();
            payload.insert("url".into(), json!(format!("https://example.com/doc/{i}")));
            (payload, if i % 3 == 0 { 10 } else { 0 })
        })
        .collect();
    let handles = pool.submit_tasks(batch).await?;
    info!(submitted = handles.len(), "batch submitted");

    // (D) Wait for the queue to drain, then show what happened.
    let drained = pool.wait_for_completion(Duration::from_secs(60)).await?;
    let status = pool.get_status().await;
    info!(
        drained,
        completed = status.queue.completed,
        failed = status.queue.failed,
        "run finished"
    );
    for worker in &status.workers {
        info!(
            worker = worker.id,
            state = ?worker.state,
            processed = worker.processed,
            failed = worker.failed,
            restarts = worker.restarts,
            "worker summary"
        );
    }
    for handle in &handles {
        if let Some(view) = handle.collect().await {
            println!(
                "{} -> {:?} (attempts={}, result={})",
                view.id,
                view.status,
                view.retries + 1,
                view.result.unwrap_or(Value::Null),
            );
        }
    }

    // (E) Export the monitor history before tearing down.
    let export = std::env::temp_dir().join("fetchpool-monitor.json");
    pool.monitor().export_data(&export).await?;
    info!(path = %export.display(), "monitor history exported");

    if !pool.shutdown(Duration::from_secs(10)).await? {
        warn!("shutdown grace elapsed; remaining tasks were abandoned");
    }
    Ok(())
}
