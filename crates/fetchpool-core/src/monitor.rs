//! Resource monitor: samples host usage on an interval, tracks
//! per-worker counters, exports history.
//!
//! Monitoring is observational only. It never touches task or worker
//! control state; the pool reads monitor output and makes its own
//! throttling decisions, so control state keeps a single writer.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub sample_interval: Duration,

    /// Rolling history bound; oldest samples are dropped first.
    pub history_size: usize,

    /// Memory-use fraction at which a warning is logged.
    pub memory_warn_fraction: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(2),
            history_size: 256,
            memory_warn_fraction: 0.9,
        }
    }
}

/// Point-in-time host reading. Immutable once taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub taken_at: DateTime<Utc>,
    pub cpu_count: usize,
    pub cpu_usage_percent: f32,
    pub total_ram: u64,
    pub available_ram: u64,
}

impl ResourceSample {
    /// Fraction of RAM in use, 0-1.
    pub fn memory_pressure(&self) -> f64 {
        if self.total_ram == 0 {
            return 0.0;
        }
        1.0 - self.available_ram as f64 / self.total_ram as f64
    }
}

/// Cumulative per-worker counters. Written additively by the worker
/// loop, read by status queries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub processed: u64,
    pub failed: u64,
}

/// Cheap snapshot: latest sample plus current counters, no history
/// recomputation, so it can be polled frequently.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub host: Option<ResourceSample>,
    pub workers: HashMap<usize, WorkerMetrics>,
    pub active_workers: usize,
}

#[derive(Serialize)]
struct ExportedData {
    exported_at: DateTime<Utc>,
    samples: Vec<ResourceSample>,
    workers: HashMap<usize, WorkerMetrics>,
}

struct MonitorShared {
    current: RwLock<Option<ResourceSample>>,
    history: RwLock<VecDeque<ResourceSample>>,
    workers: RwLock<HashMap<usize, WorkerMetrics>>,
}

pub struct ResourceMonitor {
    config: MonitorConfig,
    shared: Arc<MonitorShared>,
    runtime: StdMutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            shared: Arc::new(MonitorShared {
                current: RwLock::new(None),
                history: RwLock::new(VecDeque::new()),
                workers: RwLock::new(HashMap::new()),
            }),
            runtime: StdMutex::new(None),
        }
    }

    /// Begin the background sampling loop. Idempotent.
    pub fn start_monitoring(&self) {
        let mut runtime = self.runtime.lock().expect("monitor runtime lock");
        if runtime.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            let mut sys = System::new_with_specifics(
                RefreshKind::new()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            );
            let mut tick = interval(config.sample_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        sys.refresh_cpu_usage();
                        sys.refresh_memory();
                        let sample = ResourceSample {
                            taken_at: Utc::now(),
                            cpu_count: sys.cpus().len(),
                            cpu_usage_percent: sys.global_cpu_usage(),
                            total_ram: sys.total_memory(),
                            available_ram: sys.available_memory(),
                        };
                        if sample.memory_pressure() >= config.memory_warn_fraction {
                            warn!(
                                pressure = format!("{:.2}", sample.memory_pressure()),
                                "host memory pressure above warning threshold"
                            );
                        }
                        debug!(cpu = sample.cpu_usage_percent, "resource sample taken");

                        *shared.current.write().await = Some(sample.clone());
                        let mut history = shared.history.write().await;
                        history.push_back(sample);
                        while history.len() > config.history_size {
                            history.pop_front();
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("resource monitor stopped");
        });

        *runtime = Some((shutdown_tx, handle));
        info!(interval_ms = self.config.sample_interval.as_millis() as u64, "resource monitor started");
    }

    /// Stop the sampling loop and wait for it. Idempotent.
    pub async fn stop_monitoring(&self) {
        let taken = self.runtime.lock().expect("monitor runtime lock").take();
        if let Some((shutdown_tx, handle)) = taken {
            let _ = shutdown_tx.send(true);
            let _ = handle.await;
        }
    }

    /// Begin tracking a worker's counters.
    pub async fn register_worker(&self, worker_id: usize) {
        self.shared
            .workers
            .write()
            .await
            .insert(worker_id, WorkerMetrics::default());
    }

    /// Stop tracking a worker. Required on teardown so the tracked set
    /// does not grow without bound across restarts.
    pub async fn unregister_worker(&self, worker_id: usize) {
        self.shared.workers.write().await.remove(&worker_id);
    }

    /// Add to a worker's cumulative counters.
    pub async fn update_worker_metrics(&self, worker_id: usize, processed: u64, failed: u64) {
        if let Some(m) = self.shared.workers.write().await.get_mut(&worker_id) {
            m.processed += processed;
            m.failed += failed;
        }
    }

    /// Latest sample plus current counters.
    pub async fn get_current_status(&self) -> MonitorStatus {
        let host = self.shared.current.read().await.clone();
        let workers = self.shared.workers.read().await.clone();
        let active_workers = workers.len();
        MonitorStatus {
            host,
            workers,
            active_workers,
        }
    }

    /// Memory-use fraction from the latest sample; 0 before the first
    /// sample lands so nothing throttles on startup.
    pub async fn memory_pressure(&self) -> f64 {
        self.shared
            .current
            .read()
            .await
            .as_ref()
            .map(ResourceSample::memory_pressure)
            .unwrap_or(0.0)
    }

    /// Serialize accumulated history to `path` as JSON. Reads a
    /// copy-on-read snapshot, so it is safe alongside the sampling loop.
    pub async fn export_data(&self, path: &Path) -> Result<(), crate::error::PoolError> {
        let data = ExportedData {
            exported_at: Utc::now(),
            samples: self.shared.history.read().await.iter().cloned().collect(),
            workers: self.shared.workers.read().await.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&data).map_err(|e| crate::error::PoolError::Export {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        std::fs::write(path, bytes).map_err(|source| crate::error::PoolError::Export {
            path: path.to_path_buf(),
            source,
        })
    }
}
