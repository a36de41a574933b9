//! Profile manager: isolated, disposable execution contexts.
//!
//! Each worker gets its own clone of a base profile template (directory
//! tree with cached state and credentials), so no filesystem state is
//! shared across workers and a crashed worker's context can be thrown
//! away without affecting siblings.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::PoolError;
use crate::ids::ProfileId;

/// A worker's exclusive execution context. Exactly one context is bound
/// to one worker at a time; the manager reclaims it on teardown.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub id: ProfileId,
    pub worker_id: usize,
    pub path: PathBuf,

    /// Passed through to the executor, not interpreted by the core.
    pub headless: bool,

    pub created_at: DateTime<Utc>,
}

/// Clones the base template into per-worker directories and enforces the
/// concurrent clone ceiling. Requests beyond the ceiling fail fast
/// rather than queue.
pub struct ProfileManager {
    base: PathBuf,
    clone_root: PathBuf,
    headless: bool,
    max_profiles: usize,
    live: Mutex<HashMap<ProfileId, PathBuf>>,
}

impl ProfileManager {
    pub fn new(
        base: impl Into<PathBuf>,
        clone_root: impl Into<PathBuf>,
        max_profiles: usize,
        headless: bool,
    ) -> Self {
        Self {
            base: base.into(),
            clone_root: clone_root.into(),
            headless,
            max_profiles,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Clone the base template into a fresh directory for `worker_id`.
    pub fn create_profile(&self, worker_id: usize) -> Result<ExecutionContext, PoolError> {
        let id = ProfileId::generate();
        let path = self.clone_root.join(format!("worker-{worker_id}-{id}"));

        // Reserve the slot before the copy so concurrent creators cannot
        // overshoot the ceiling while a clone is in progress.
        {
            let mut live = self.live.lock().expect("profile map lock");
            if live.len() >= self.max_profiles {
                return Err(PoolError::ProfileLimitExceeded {
                    limit: self.max_profiles,
                });
            }
            live.insert(id, path.clone());
        }

        if let Err(source) = copy_dir(&self.base, &path) {
            self.live.lock().expect("profile map lock").remove(&id);
            let _ = fs::remove_dir_all(&path);
            return Err(PoolError::CloneError { path, source });
        }

        tracing::debug!(worker = worker_id, profile = %id, path = %path.display(), "cloned profile");
        Ok(ExecutionContext {
            id,
            worker_id,
            path,
            headless: self.headless,
            created_at: Utc::now(),
        })
    }

    /// Delete the context's directory and release its slot. Idempotent:
    /// cleaning up an unknown or already-removed context is a no-op.
    pub fn cleanup_profile(&self, context: &ExecutionContext) -> Result<(), PoolError> {
        self.live.lock().expect("profile map lock").remove(&context.id);
        remove_tree(&context.path)
    }

    /// Remove every tracked context. No tracked context survives this
    /// call; used at pool shutdown.
    pub fn cleanup_all_profiles(&self) {
        let drained: Vec<(ProfileId, PathBuf)> = {
            let mut live = self.live.lock().expect("profile map lock");
            live.drain().collect()
        };
        for (id, path) in drained {
            if let Err(e) = remove_tree(&path) {
                tracing::warn!(profile = %id, error = %e, "failed to remove profile directory");
            }
        }
    }

    /// Number of currently tracked contexts.
    pub fn live_count(&self) -> usize {
        self.live.lock().expect("profile map lock").len()
    }
}

fn remove_tree(path: &Path) -> Result<(), PoolError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PoolError::CloneError {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
