//! Coalescing of bursts of filesystem events.
//!
//! The debouncer holds no clock of its own; callers pass `now`, which keeps
//! it deterministic under test.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// What happened to a path, as last reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created or modified
    Upsert,
    /// Deleted
    Remove,
    /// A directory changed; the whole project tree must be re-synced
    Sync,
}

/// A pending re-index of one file, or of a whole project tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexJob {
    pub project_id: String,
    /// Project root on disk
    pub root: PathBuf,
    /// Path relative to `root`, `/`-separated; empty for tree syncs
    pub rel_path: String,
    pub kind: ChangeKind,
}

impl ReindexJob {
    /// Job re-synchronising every file under `root`.
    pub fn sync(project_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            project_id: project_id.into(),
            root: root.into(),
            rel_path: String::new(),
            kind: ChangeKind::Sync,
        }
    }

    /// Key identifying the file this job targets.
    pub fn key(&self) -> String {
        format!("{}/{}", self.project_id, self.rel_path)
    }
}

struct Pending {
    job: ReindexJob,
    deadline: Instant,
}

/// Collapses repeated events for a path into one job per quiet window.
pub struct Debouncer {
    window: Duration,
    pending: HashMap<String, Pending>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record an event. A path that is already pending keeps a single entry
    /// with the latest kind and a deadline pushed out by the window.
    pub fn push(&mut self, job: ReindexJob, now: Instant) {
        let deadline = now + self.window;
        self.pending.insert(job.key(), Pending { job, deadline });
    }

    /// Remove and return all jobs whose quiet window has elapsed, oldest first.
    pub fn drain_due(&mut self, now: Instant) -> Vec<ReindexJob> {
        let due_keys: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();

        let mut due: Vec<Pending> = due_keys
            .into_iter()
            .filter_map(|k| self.pending.remove(&k))
            .collect();
        due.sort_by(|a, b| a.deadline.cmp(&b.deadline).then_with(|| a.job.rel_path.cmp(&b.job.rel_path)));
        due.into_iter().map(|p| p.job).collect()
    }

    /// Earliest deadline among pending jobs.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Drop pending jobs of a project.
    pub fn discard_project(&mut self, project_id: &str) {
        self.pending.retain(|_, p| p.job.project_id != project_id);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
