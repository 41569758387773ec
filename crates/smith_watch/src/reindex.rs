//! Execution of debounced re-index jobs.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use smith_index::{PathLocks, VectorIndex};
use tracing::{debug, warn};

use crate::debounce::{ChangeKind, ReindexJob};
use crate::error::WatchError;

/// Counters describing what the watcher has done.
#[derive(Debug, Default)]
pub struct WatchStats {
    reindexed: AtomicU64,
    removed: AtomicU64,
    dropped: AtomicU64,
}

impl WatchStats {
    /// Files whose fragments were rebuilt
    pub fn reindexed(&self) -> u64 {
        self.reindexed.load(Ordering::Relaxed)
    }

    /// Files whose fragments were removed
    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    /// Jobs abandoned after exhausting retries
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Reindexed { chunks: usize },
    Removed,
    Synced { indexed: usize, removed: usize },
    Dropped,
}

/// Applies re-index jobs to the index under the per-path lock.
#[derive(Clone)]
pub struct Reindexer {
    index: Arc<VectorIndex>,
    locks: PathLocks,
    read_retries: u32,
    retry_delay: Duration,
    stats: Arc<WatchStats>,
}

impl Reindexer {
    pub fn new(index: Arc<VectorIndex>, locks: PathLocks, read_retries: u32, retry_delay: Duration) -> Self {
        Self {
            index,
            locks,
            read_retries,
            retry_delay,
            stats: Arc::new(WatchStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WatchStats> {
        self.stats.clone()
    }

    /// Process one job. Failures are logged and counted, never returned.
    pub async fn process(&self, job: &ReindexJob) -> JobOutcome {
        if job.kind == ChangeKind::Sync {
            return self.sync_tree(job).await;
        }

        let _guard = self.locks.lock(&job.project_id, &job.rel_path).await;
        let path = job.root.join(&job.rel_path);

        let mut attempt = 0u32;
        let content = loop {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => break Some(content),
                Err(e) if e.kind() == ErrorKind::NotFound => break None,
                Err(e) if attempt < self.read_retries => {
                    attempt += 1;
                    debug!(path = %path.display(), attempt, error = %e, "Read failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    let err = WatchError::Read {
                        path: path.clone(),
                        attempts: attempt + 1,
                        source: e,
                    };
                    warn!(project_id = %job.project_id, error = %err, "Dropping re-index job");
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    return JobOutcome::Dropped;
                }
            }
        };

        match content {
            Some(content) => match self.index.index_content(&job.project_id, &job.rel_path, &content).await {
                Ok(chunks) => {
                    if job.kind == ChangeKind::Remove {
                        debug!(path = %job.rel_path, "File reappeared after remove event");
                    }
                    debug!(project_id = %job.project_id, path = %job.rel_path, chunks, "Re-indexed file");
                    self.stats.reindexed.fetch_add(1, Ordering::Relaxed);
                    JobOutcome::Reindexed { chunks }
                }
                Err(e) => {
                    let err = WatchError::from(e);
                    warn!(project_id = %job.project_id, path = %job.rel_path, error = %err, "Dropping re-index job");
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    JobOutcome::Dropped
                }
            },
            None => match self.index.remove(&job.project_id, Some(&job.rel_path)) {
                Ok(_) => {
                    debug!(project_id = %job.project_id, path = %job.rel_path, "Removed fragments of deleted file");
                    self.stats.removed.fetch_add(1, Ordering::Relaxed);
                    JobOutcome::Removed
                }
                Err(e) => {
                    let err = WatchError::from(e);
                    warn!(project_id = %job.project_id, path = %job.rel_path, error = %err, "Dropping remove job");
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    JobOutcome::Dropped
                }
            },
        }
    }

    /// Re-sync a whole project tree while holding the project exclusively.
    async fn sync_tree(&self, job: &ReindexJob) -> JobOutcome {
        let _project = self.locks.lock_project(&job.project_id).await;
        match self.index.sync_tree(&job.project_id, &job.root).await {
            Ok(report) => {
                debug!(
                    project_id = %job.project_id,
                    indexed = report.indexed,
                    removed = report.removed,
                    "Re-synced project tree"
                );
                self.stats.reindexed.fetch_add(report.indexed as u64, Ordering::Relaxed);
                self.stats.removed.fetch_add(report.removed as u64, Ordering::Relaxed);
                JobOutcome::Synced {
                    indexed: report.indexed,
                    removed: report.removed,
                }
            }
            Err(e) => {
                let err = WatchError::from(e);
                warn!(project_id = %job.project_id, error = %err, "Dropping tree sync");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                JobOutcome::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smith_index::HashEmbedder;
    use std::fs;
    use tempfile::tempdir;

    fn reindexer(retries: u32) -> (Reindexer, Arc<VectorIndex>) {
        let index = Arc::new(VectorIndex::in_memory(Arc::new(HashEmbedder::default())));
        let reindexer = Reindexer::new(index.clone(), PathLocks::new(), retries, Duration::from_millis(10));
        (reindexer, index)
    }

    fn job(root: &std::path::Path, rel: &str, kind: ChangeKind) -> ReindexJob {
        ReindexJob {
            project_id: "site-a".to_string(),
            root: root.to_path_buf(),
            rel_path: rel.to_string(),
            kind,
        }
    }

    #[tokio::test]
    async fn test_modify_reindexes() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("styles.css"), "body { color: teal; }").unwrap();
        let (reindexer, index) = reindexer(1);

        let outcome = reindexer.process(&job(temp.path(), "styles.css", ChangeKind::Upsert)).await;
        assert_eq!(outcome, JobOutcome::Reindexed { chunks: 1 });
        assert_eq!(index.fragments_for("site-a", "styles.css")[0].text, "body { color: teal; }");
        assert_eq!(reindexer.stats().reindexed(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_removes() {
        let temp = tempdir().unwrap();
        let (reindexer, index) = reindexer(1);
        index.index_content("site-a", "app.js", "let a = 1;").await.unwrap();

        let outcome = reindexer.process(&job(temp.path(), "app.js", ChangeKind::Remove)).await;
        assert_eq!(outcome, JobOutcome::Removed);
        assert!(index.is_empty());
        assert_eq!(reindexer.stats().removed(), 1);
    }

    #[tokio::test]
    async fn test_tree_sync_follows_moved_directory() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("css")).unwrap();
        fs::write(temp.path().join("css").join("main.css"), "h1 { color: red; }").unwrap();
        let (reindexer, index) = reindexer(1);
        index.sync_tree("site-a", temp.path()).await.unwrap();

        fs::rename(temp.path().join("css"), temp.path().join("styles")).unwrap();
        let outcome = reindexer.process(&ReindexJob::sync("site-a", temp.path())).await;

        assert_eq!(outcome, JobOutcome::Synced { indexed: 1, removed: 1 });
        assert_eq!(index.files("site-a"), vec!["styles/main.css".to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_dropped_after_retries() {
        let temp = tempdir().unwrap();
        // A directory named like a stylesheet cannot be read as a file.
        fs::create_dir(temp.path().join("broken.css")).unwrap();
        let (reindexer, index) = reindexer(2);

        let outcome = reindexer.process(&job(temp.path(), "broken.css", ChangeKind::Upsert)).await;
        assert_eq!(outcome, JobOutcome::Dropped);
        assert!(index.is_empty());
        assert_eq!(reindexer.stats().dropped(), 1);
    }
}
