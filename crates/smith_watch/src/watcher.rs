//! Recursive directory watching per project.
//!
//! Raw `notify` events flow into a single debounce task. Due jobs are routed
//! to a fixed set of workers by hashing the file key, so all jobs for one
//! file run in order on the same worker while different files proceed in
//! parallel.
//!
//! Events naming a directory (a folder renamed, moved in or deleted) carry
//! no file paths for its contents, so they schedule a sync of the whole
//! project tree instead.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use smith_index::{is_indexable, normalize_rel_path, PathLocks, VectorIndex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::debounce::{ChangeKind, Debouncer, ReindexJob};
use crate::error::{WatchError, WatchResult};
use crate::reindex::{Reindexer, WatchStats};

/// Tuning for the watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period before a burst of events for one path is processed
    pub debounce: Duration,
    /// Extra read attempts for a file that fails to read
    pub read_retries: u32,
    /// Delay between read attempts
    pub retry_delay: Duration,
    /// Number of re-index workers
    pub workers: usize,
    /// Capacity of each worker's job queue
    pub queue_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            read_retries: 2,
            retry_delay: Duration::from_millis(150),
            workers: 4,
            queue_capacity: 256,
        }
    }
}

struct WatchedProject {
    _watcher: RecommendedWatcher,
}

/// Input of the debounce task.
enum Message {
    Change(ReindexJob),
    /// Forget pending jobs of an unwatched project
    Discard(String),
}

struct Shared {
    watched: Mutex<HashMap<String, WatchedProject>>,
}

impl Shared {
    fn is_watching(&self, project_id: &str) -> bool {
        self.watched.lock().contains_key(project_id)
    }
}

/// Keeps the index in step with edits made directly on disk.
pub struct ProjectWatcher {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Message>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<WatchStats>,
}

impl ProjectWatcher {
    /// Spawn the debounce task and workers. Must be called inside a tokio runtime.
    pub fn start(index: Arc<VectorIndex>, locks: PathLocks, config: WatcherConfig) -> Self {
        let workers = config.workers.max(1);
        let reindexer = Reindexer::new(index, locks, config.read_retries, config.retry_delay);
        let stats = reindexer.stats();
        let shared = Arc::new(Shared {
            watched: Mutex::new(HashMap::new()),
        });

        let mut tasks = Vec::with_capacity(workers + 1);
        let mut queues = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            queues.push(tx);
            tasks.push(tokio::spawn(run_worker(worker_id, rx, reindexer.clone(), shared.clone())));
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tasks.push(tokio::spawn(run_debounce(events_rx, queues, config.debounce, shutdown_rx)));

        info!(workers, debounce_ms = config.debounce.as_millis() as u64, "File watcher started");

        Self {
            shared,
            events,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            stats,
        }
    }

    /// Begin watching `root` recursively on behalf of `project_id`.
    ///
    /// Watching an already watched project replaces the previous registration.
    pub fn watch(&self, project_id: &str, root: &Path) -> WatchResult<()> {
        if *self.shutdown_tx.borrow() {
            return Err(WatchError::ShutDown);
        }
        if !root.is_dir() {
            return Err(WatchError::RootNotFound(root.to_path_buf()));
        }

        let canonical = std::fs::canonicalize(root)?;
        let roots = vec![root.to_path_buf(), canonical];
        let events = self.events.clone();
        let project = project_id.to_string();
        let job_root = root.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let kind = if event.kind.is_remove() {
                        ChangeKind::Remove
                    } else if event.kind.is_create() || event.kind.is_modify() {
                        ChangeKind::Upsert
                    } else {
                        return;
                    };
                    for path in &event.paths {
                        let Some(rel_path) = relative_to(path, &roots) else {
                            continue;
                        };
                        let job = if is_indexable(path) {
                            ReindexJob {
                                project_id: project.clone(),
                                root: job_root.clone(),
                                rel_path,
                                kind,
                            }
                        } else if needs_tree_sync(path, &rel_path) {
                            ReindexJob::sync(project.clone(), job_root.clone())
                        } else {
                            continue;
                        };
                        let _ = events.send(Message::Change(job));
                    }
                }
                Err(e) => warn!(project_id = %project, error = %e, "Watch error"),
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        self.shared.watched.lock().insert(
            project_id.to_string(),
            WatchedProject { _watcher: watcher },
        );
        info!(project_id, root = %root.display(), "Watching project");
        Ok(())
    }

    /// Stop watching a project and drop its pending jobs. Unknown projects
    /// are ignored.
    ///
    /// A job already running finishes; callers that must not race it take
    /// the project lock exclusively.
    pub fn unwatch(&self, project_id: &str) {
        if self.shared.watched.lock().remove(project_id).is_some() {
            let _ = self.events.send(Message::Discard(project_id.to_string()));
            info!(project_id, "Stopped watching project");
        }
    }

    pub fn is_watching(&self, project_id: &str) -> bool {
        self.shared.is_watching(project_id)
    }

    pub fn stats(&self) -> Arc<WatchStats> {
        self.stats.clone()
    }

    /// Stop all watches and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.shared.watched.lock().clear();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Watcher task ended abnormally");
            }
        }
        info!("File watcher stopped");
    }
}

fn relative_to(path: &Path, roots: &[PathBuf]) -> Option<String> {
    roots
        .iter()
        .find_map(|root| path.strip_prefix(root).ok())
        .map(normalize_rel_path)
        .filter(|rel| !rel.is_empty())
}

/// Whether an event on a non-indexable path may hide changes to indexed
/// files: a directory, or a vanished path without an extension.
fn needs_tree_sync(path: &Path, rel_path: &str) -> bool {
    if rel_path.split('/').any(|part| part.starts_with('.')) {
        return false;
    }
    path.is_dir() || (!path.exists() && path.extension().is_none())
}

fn worker_for(key: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn run_debounce(
    mut events: mpsc::UnboundedReceiver<Message>,
    queues: Vec<mpsc::Sender<ReindexJob>>,
    window: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut debouncer = Debouncer::new(window);

    loop {
        let next = debouncer.next_deadline();
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(Message::Change(job)) => debouncer.push(job, Instant::now()),
                Some(Message::Discard(project_id)) => debouncer.discard_project(&project_id),
                None => break,
            },
            _ = sleep_until(next) => {}
        }

        for job in debouncer.drain_due(Instant::now()) {
            let worker = worker_for(&job.key(), queues.len());
            if queues[worker].send(job).await.is_err() {
                return;
            }
        }
    }

    debug!(pending = debouncer.len(), "Debounce task exiting");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run_worker(worker_id: usize, mut jobs: mpsc::Receiver<ReindexJob>, reindexer: Reindexer, shared: Arc<Shared>) {
    while let Some(job) = jobs.recv().await {
        if !shared.is_watching(&job.project_id) {
            debug!(worker_id, project_id = %job.project_id, "Skipping job for unwatched project");
            continue;
        }
        reindexer.process(&job).await;
    }
    debug!(worker_id, "Re-index worker exiting");
}
