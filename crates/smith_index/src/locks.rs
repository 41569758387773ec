//! Per-file async locks with a project-wide exclusive mode.
//!
//! The watcher and the agent can both rewrite and re-index the same file.
//! Holding the lock for `(project, file)` across "write, read back, index"
//! keeps those sequences from interleaving.
//!
//! Every file lock also holds its project's lock in shared mode. Taking the
//! project lock exclusively therefore waits for all in-flight file work of
//! that project and keeps new work out until released; clearing a project
//! and syncing a whole tree rely on this.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Holds one or more file locks of a single project.
#[must_use = "the lock is released when the guard is dropped"]
pub struct PathGuard {
    _files: Vec<OwnedMutexGuard<()>>,
    _project: OwnedRwLockReadGuard<()>,
}

/// Holds a project exclusively.
#[must_use = "the lock is released when the guard is dropped"]
pub struct ProjectGuard {
    _project: OwnedRwLockWriteGuard<()>,
}

#[derive(Default)]
struct Registry {
    projects: HashMap<String, Arc<RwLock<()>>>,
    files: HashMap<String, Arc<AsyncMutex<()>>>,
}

impl Registry {
    fn project(&mut self, project_id: &str) -> Arc<RwLock<()>> {
        self.projects
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn file(&mut self, project_id: &str, file_path: &str) -> Arc<AsyncMutex<()>> {
        self.files
            .entry(file_key(project_id, file_path))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

fn file_key(project_id: &str, file_path: &str) -> String {
    format!("{}/{}", project_id, file_path)
}

/// Shared registry of per-file locks. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct PathLocks {
    inner: Arc<Mutex<Registry>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `file_path` within `project_id`.
    pub async fn lock(&self, project_id: &str, file_path: &str) -> PathGuard {
        self.lock_many(project_id, [file_path]).await
    }

    /// Lock several files of one project at once.
    ///
    /// Files are locked in sorted order, so two callers locking overlapping
    /// sets cannot deadlock. The project lock is taken once, in shared mode.
    pub async fn lock_many<'a, I>(&self, project_id: &str, file_paths: I) -> PathGuard
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut paths: Vec<&str> = file_paths.into_iter().collect();
        paths.sort_unstable();
        paths.dedup();

        let project = self.inner.lock().project(project_id);
        let project_guard = project.read_owned().await;

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let mutex = self.inner.lock().file(project_id, path);
            files.push(mutex.lock_owned().await);
        }
        PathGuard {
            _files: files,
            _project: project_guard,
        }
    }

    /// Wait until no file of `project_id` is locked, then hold the project
    /// so that no file lock of it can be taken until the guard drops.
    pub async fn lock_project(&self, project_id: &str) -> ProjectGuard {
        let project = self.inner.lock().project(project_id);
        ProjectGuard {
            _project: project.write_owned().await,
        }
    }

    /// Drop idle lock entries belonging to a project.
    pub fn forget_project(&self, project_id: &str) {
        let prefix = format!("{}/", project_id);
        let mut registry = self.inner.lock();
        registry
            .files
            .retain(|key, mutex| !key.starts_with(&prefix) || Arc::strong_count(mutex) > 1);
        if let Some(project) = registry.projects.get(project_id) {
            if Arc::strong_count(project) == 1 {
                registry.projects.remove(project_id);
            }
        }
    }

    /// Number of tracked file lock entries.
    pub fn len(&self) -> usize {
        self.inner.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
