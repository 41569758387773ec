//! Fragment store with similarity search and durable snapshots.
//!
//! Fragments are grouped by project and file. Every mutation swaps a whole
//! file entry under the write lock, so a concurrent query sees either the old
//! complete set of fragments for a file or the new complete set.
//!
//! When opened with a path, the full index is written to disk after each
//! mutation using an atomic rename. Several processes may share one snapshot
//! file (a foreground watcher next to one-shot chat commands): every commit
//! takes an exclusive lock on the file, re-reads the snapshot if another
//! handle replaced it, applies the change on top and writes the result. The
//! persisted revision counter grows by one per committed snapshot.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::atomic::{write_atomic, FileLock, FileStamp};
use crate::chunker::{chunk_text, is_indexable, normalize_rel_path, DEFAULT_CHUNK_CHARS};
use crate::embedder::{cosine_similarity, Embedder};
use crate::error::{IndexError, IndexResult};
use crate::fragment::{IndexOutcome, IndexedFragment, ScoredFragment, SyncReport};

type ProjectFiles = BTreeMap<String, Vec<IndexedFragment>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    #[serde(rename = "modelKey")]
    model_key: String,
    #[serde(rename = "nextSeq")]
    next_seq: u64,
    #[serde(default)]
    revision: u64,
    projects: BTreeMap<String, ProjectFiles>,
}

enum Change {
    ReplaceFile {
        project_id: String,
        file_path: String,
        fragments: Vec<IndexedFragment>,
    },
    RemoveFile {
        project_id: String,
        file_path: String,
    },
    RemoveProject {
        project_id: String,
    },
}

enum Undo {
    File {
        project_id: String,
        file_path: String,
        previous: Option<Vec<IndexedFragment>>,
    },
    Project {
        project_id: String,
        previous: Option<ProjectFiles>,
    },
}

impl IndexState {
    /// Apply a change, returning how to undo it and how many fragments it touched.
    fn apply(&mut self, change: Change) -> (Undo, usize) {
        match change {
            Change::ReplaceFile {
                project_id,
                file_path,
                mut fragments,
            } => {
                for fragment in &mut fragments {
                    fragment.seq = self.next_seq;
                    self.next_seq += 1;
                }
                let affected = fragments.len();
                let files = self.projects.entry(project_id.clone()).or_default();
                let previous = if fragments.is_empty() {
                    files.remove(&file_path)
                } else {
                    files.insert(file_path.clone(), fragments)
                };
                if files.is_empty() {
                    self.projects.remove(&project_id);
                }
                (
                    Undo::File {
                        project_id,
                        file_path,
                        previous,
                    },
                    affected,
                )
            }
            Change::RemoveFile {
                project_id,
                file_path,
            } => {
                let mut previous = None;
                if let Some(files) = self.projects.get_mut(&project_id) {
                    previous = files.remove(&file_path);
                    if files.is_empty() {
                        self.projects.remove(&project_id);
                    }
                }
                let affected = previous.as_ref().map_or(0, |p| p.len());
                (
                    Undo::File {
                        project_id,
                        file_path,
                        previous,
                    },
                    affected,
                )
            }
            Change::RemoveProject { project_id } => {
                let previous = self.projects.remove(&project_id);
                let affected = previous
                    .as_ref()
                    .map_or(0, |files| files.values().map(|f| f.len()).sum());
                (
                    Undo::Project {
                        project_id,
                        previous,
                    },
                    affected,
                )
            }
        }
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::File {
                project_id,
                file_path,
                previous,
            } => {
                let files = self.projects.entry(project_id.clone()).or_default();
                match previous {
                    Some(fragments) => {
                        files.insert(file_path, fragments);
                    }
                    None => {
                        files.remove(&file_path);
                    }
                }
                if files.is_empty() {
                    self.projects.remove(&project_id);
                }
            }
            Undo::Project {
                project_id,
                previous,
            } => {
                if let Some(files) = previous {
                    self.projects.insert(project_id, files);
                }
            }
        }
    }
}

impl IndexState {
    fn fragment_count(&self) -> usize {
        self.projects
            .values()
            .flat_map(|files| files.values())
            .map(|f| f.len())
            .sum()
    }

    /// Read the snapshot at `path`; a missing or blank file is an empty index.
    fn read(path: &Path) -> IndexResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content).map_err(|e| IndexError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Drop fragments embedded by a different model and adopt `model_key`.
    fn adopt_model(&mut self, model_key: &str) {
        if !self.projects.is_empty() && self.model_key != model_key {
            warn!(
                stored = %self.model_key,
                active = %model_key,
                "Embedding model changed, discarding stored fragments"
            );
            self.projects.clear();
        }
        self.model_key = model_key.to_string();
    }
}

fn is_noop(undo: &Undo, affected: usize) -> bool {
    affected == 0 && matches!(undo, Undo::File { previous: None, .. } | Undo::Project { previous: None, .. })
}

/// On-disk home of a persisted index.
struct Snapshot {
    path: PathBuf,
    /// Stamp of the snapshot file as this handle last read or wrote it
    seen: Mutex<Option<FileStamp>>,
    /// Serialises commits of this handle
    commit: Mutex<()>,
}

/// Nearest-neighbour index over embedded project fragments.
pub struct VectorIndex {
    embedder: Arc<dyn Embedder>,
    model_key: String,
    snapshot: Option<Snapshot>,
    state: RwLock<IndexState>,
}

impl VectorIndex {
    /// Create an index that lives only in memory.
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        let model_key = embedder.model_key();
        let state = IndexState {
            model_key: model_key.clone(),
            ..IndexState::default()
        };
        Self {
            embedder,
            model_key,
            snapshot: None,
            state: RwLock::new(state),
        }
    }

    /// Open (or create) an index persisted at `path`.
    ///
    /// Fragments embedded with a different model are discarded; they are
    /// rebuilt by the next tree sync.
    pub fn open(path: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();
        let model_key = embedder.model_key();

        let (mut state, stamp) = {
            let _lock = FileLock::acquire(&path).map_err(|e| lock_error(&path, e))?;
            (IndexState::read(&path)?, FileStamp::of(&path)?)
        };
        state.adopt_model(&model_key);
        info!(
            path = %path.display(),
            fragments = state.fragment_count(),
            revision = state.revision,
            "Opened vector index"
        );

        Ok(Self {
            embedder,
            model_key,
            snapshot: Some(Snapshot {
                path,
                seen: Mutex::new(stamp),
                commit: Mutex::new(()),
            }),
            state: RwLock::new(state),
        })
    }

    /// Pick up a snapshot written by another handle since this one last
    /// read or wrote it. Returns whether anything was reloaded.
    ///
    /// In-memory indexes never reload. A refresh is skipped while this
    /// handle is committing, since the commit re-reads under the file lock.
    pub fn refresh(&self) -> IndexResult<bool> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(false);
        };
        let Some(_commit) = snapshot.commit.try_lock() else {
            return Ok(false);
        };
        self.reload_if_stale(snapshot)
    }

    /// Persisted revision of the state this handle currently holds.
    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }

    /// Replace every fragment of `(project_id, file_path)` with `chunks`.
    ///
    /// An empty chunk list removes the file from the index.
    pub async fn upsert(&self, project_id: &str, file_path: &str, chunks: Vec<String>) -> IndexResult<usize> {
        let embeddings = if chunks.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed(&chunks).await?
        };
        if embeddings.len() != chunks.len() {
            return Err(IndexError::Embedding(format!(
                "Expected {} vectors, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }

        let fragments: Vec<IndexedFragment> = chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(chunk_index, (text, embedding))| IndexedFragment {
                project_id: project_id.to_string(),
                file_path: file_path.to_string(),
                chunk_index,
                text,
                embedding,
                seq: 0,
            })
            .collect();

        let count = self.commit(Change::ReplaceFile {
            project_id: project_id.to_string(),
            file_path: file_path.to_string(),
            fragments,
        })?;
        debug!(project_id, file_path, chunks = count, "Upserted fragments");
        Ok(count)
    }

    /// Chunk `content` and upsert it for `(project_id, file_path)`.
    pub async fn index_content(&self, project_id: &str, file_path: &str, content: &str) -> IndexResult<usize> {
        let chunks = chunk_text(content, DEFAULT_CHUNK_CHARS);
        self.upsert(project_id, file_path, chunks).await
    }

    /// Read `root/rel_path` from disk and index it.
    ///
    /// A missing file has its fragments removed.
    pub async fn index_file(&self, project_id: &str, root: &Path, rel_path: &str) -> IndexResult<IndexOutcome> {
        if !is_indexable(Path::new(rel_path)) {
            return Ok(IndexOutcome::Skipped);
        }

        match tokio::fs::read_to_string(root.join(rel_path)).await {
            Ok(content) => {
                let chunks = self.index_content(project_id, rel_path, &content).await?;
                Ok(IndexOutcome::Indexed { chunks })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.remove(project_id, Some(rel_path))?;
                Ok(IndexOutcome::Removed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bring the index for `project_id` in line with the files under `root`.
    ///
    /// Every indexable file is re-indexed and fragments for files that no
    /// longer exist are dropped. A missing root drops the whole project.
    pub async fn sync_tree(&self, project_id: &str, root: &Path) -> IndexResult<SyncReport> {
        let mut report = SyncReport::default();

        let candidates: Vec<String> = if root.is_dir() {
            WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && is_indexable(e.path()))
                .filter_map(|e| e.path().strip_prefix(root).ok().map(normalize_rel_path))
                .collect()
        } else {
            Vec::new()
        };

        let mut seen = HashSet::new();
        for rel_path in candidates {
            match self.index_file(project_id, root, &rel_path).await? {
                IndexOutcome::Indexed { .. } => {
                    report.indexed += 1;
                    seen.insert(rel_path);
                }
                IndexOutcome::Removed => report.removed += 1,
                IndexOutcome::Skipped => {}
            }
        }

        for file_path in self.files(project_id) {
            if !seen.contains(&file_path) {
                self.remove(project_id, Some(&file_path))?;
                report.removed += 1;
            }
        }

        debug!(project_id, indexed = report.indexed, removed = report.removed, "Synced project tree");
        Ok(report)
    }

    /// Return up to `k` fragments most similar to `text`.
    ///
    /// Results are ordered by descending similarity, ties going to the most
    /// recently inserted fragment. `scope` restricts candidates to one project.
    pub async fn query(&self, text: &str, k: usize, scope: Option<&str>) -> IndexResult<Vec<ScoredFragment>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if let Err(e) = self.refresh() {
            warn!(error = %e, "Failed to reload index snapshot, querying the loaded state");
        }
        let query_vec = self.embedder.embed_one(text).await?;

        let state = self.state.read();
        let mut scored: Vec<(f32, &IndexedFragment)> = state
            .projects
            .iter()
            .filter(|(project_id, _)| scope.map_or(true, |s| s == project_id.as_str()))
            .flat_map(|(_, files)| files.values().flatten())
            .map(|fragment| (cosine_similarity(&query_vec, &fragment.embedding), fragment))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.1.seq.cmp(&a.1.seq))
        });

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, fragment)| ScoredFragment {
                fragment: fragment.clone(),
                score,
            })
            .collect())
    }

    /// Delete fragments for one file, or for the whole project when
    /// `file_path` is `None`. Removing something absent is a no-op.
    pub fn remove(&self, project_id: &str, file_path: Option<&str>) -> IndexResult<usize> {
        let change = match file_path {
            Some(file_path) => Change::RemoveFile {
                project_id: project_id.to_string(),
                file_path: file_path.to_string(),
            },
            None => Change::RemoveProject {
                project_id: project_id.to_string(),
            },
        };
        let removed = self.commit(change)?;
        if removed > 0 {
            debug!(project_id, file_path = ?file_path, removed, "Removed fragments");
        }
        Ok(removed)
    }

    /// Projects that currently have fragments.
    pub fn projects(&self) -> Vec<String> {
        self.state.read().projects.keys().cloned().collect()
    }

    /// Indexed file paths of a project.
    pub fn files(&self, project_id: &str) -> Vec<String> {
        self.state
            .read()
            .projects
            .get(project_id)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Current fragments of one file, in chunk order.
    pub fn fragments_for(&self, project_id: &str, file_path: &str) -> Vec<IndexedFragment> {
        self.state
            .read()
            .projects
            .get(project_id)
            .and_then(|files| files.get(file_path))
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of fragments.
    pub fn len(&self) -> usize {
        self.state.read().fragment_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn commit(&self, change: Change) -> IndexResult<usize> {
        let Some(snapshot) = &self.snapshot else {
            let (_, affected) = self.state.write().apply(change);
            return Ok(affected);
        };

        let _commit = snapshot.commit.lock();
        let _lock = FileLock::acquire(&snapshot.path).map_err(|e| lock_error(&snapshot.path, e))?;
        self.reload_if_stale(snapshot)?;

        let (undo, affected, bytes) = {
            let mut state = self.state.write();
            let (undo, affected) = state.apply(change);
            if is_noop(&undo, affected) {
                return Ok(0);
            }
            state.revision += 1;
            match serde_json::to_vec(&*state) {
                Ok(bytes) => (undo, affected, bytes),
                Err(e) => {
                    state.revision -= 1;
                    state.revert(undo);
                    return Err(e.into());
                }
            }
        };

        if let Err(e) = self.write_with_retry(snapshot, &bytes) {
            let mut state = self.state.write();
            state.revision -= 1;
            state.revert(undo);
            return Err(e);
        }
        Ok(affected)
    }

    /// Replace the in-memory state with the snapshot on disk if another
    /// handle wrote it. Callers hold `snapshot.commit`.
    fn reload_if_stale(&self, snapshot: &Snapshot) -> IndexResult<bool> {
        let current = FileStamp::of(&snapshot.path)?;
        let mut seen = snapshot.seen.lock();
        if *seen == current {
            return Ok(false);
        }

        let mut fresh = IndexState::read(&snapshot.path)?;
        fresh.adopt_model(&self.model_key);
        debug!(
            path = %snapshot.path.display(),
            revision = fresh.revision,
            fragments = fresh.fragment_count(),
            "Reloaded index snapshot written by another handle"
        );
        *self.state.write() = fresh;
        *seen = current;
        Ok(true)
    }

    fn write_with_retry(&self, snapshot: &Snapshot, bytes: &[u8]) -> IndexResult<()> {
        if let Err(first) = write_atomic(&snapshot.path, bytes) {
            warn!(error = %first, "Index snapshot write failed, retrying once");
            write_atomic(&snapshot.path, bytes).map_err(|e| IndexError::Persist(e.to_string()))?;
        }
        // An unknown stamp forces a re-read on the next commit.
        *snapshot.seen.lock() = FileStamp::of(&snapshot.path).ok().flatten();
        Ok(())
    }
}

fn lock_error(path: &Path, e: std::io::Error) -> IndexError {
    IndexError::Lock {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use tempfile::tempdir;

    fn index() -> VectorIndex {
        VectorIndex::in_memory(Arc::new(HashEmbedder::default()))
    }

    #[tokio::test]
    async fn test_upsert_replaces_previous_fragments() {
        let index = index();
        index
            .upsert("p1", "styles.css", vec!["body { color: red; }".into(), "h1 { margin: 0; }".into()])
            .await
            .unwrap();
        index
            .upsert("p1", "styles.css", vec!["body { color: blue; }".into()])
            .await
            .unwrap();

        let fragments = index.fragments_for("p1", "styles.css");
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].text, "body { color: blue; }");
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_query_scope_and_ordering() {
        let index = index();
        index
            .upsert("p1", "styles.css", vec!["body { background: white; }".into()])
            .await
            .unwrap();
        index
            .upsert("p2", "styles.css", vec!["body { background: white; }".into()])
            .await
            .unwrap();
        index
            .upsert("p1", "app.js", vec!["console.log('ready');".into()])
            .await
            .unwrap();

        let global = index.query("background white", 5, None).await.unwrap();
        assert_eq!(global.len(), 3);
        // Identical text ties; the later insertion wins.
        assert_eq!(global[0].fragment.project_id, "p2");
        assert_eq!(global[1].fragment.project_id, "p1");
        assert_eq!(global[1].fragment.file_path, "styles.css");

        let scoped = index.query("background white", 5, Some("p1")).await.unwrap();
        assert!(scoped.iter().all(|s| s.fragment.project_id == "p1"));
        assert_eq!(scoped.len(), 2);

        let limited = index.query("background", 1, None).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(index.query("background", 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_noop_when_absent() {
        let index = index();
        assert_eq!(index.remove("missing", None).unwrap(), 0);
        assert_eq!(index.remove("missing", Some("index.html")).unwrap(), 0);

        index.upsert("p1", "a.css", vec!["a".into()]).await.unwrap();
        index.upsert("p1", "b.css", vec!["b".into()]).await.unwrap();
        assert_eq!(index.remove("p1", Some("a.css")).unwrap(), 1);
        assert_eq!(index.files("p1"), vec!["b.css".to_string()]);
        assert_eq!(index.remove("p1", None).unwrap(), 1);
        assert!(index.projects().is_empty());
    }

    #[tokio::test]
    async fn test_empty_upsert_removes_file() {
        let index = index();
        index.upsert("p1", "app.js", vec!["x".into()]).await.unwrap();
        index.index_content("p1", "app.js", "   \n").await.unwrap();
        assert!(index.files("p1").is_empty());
    }

    #[tokio::test]
    async fn test_persists_and_reloads() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("index").join("fragments.json");
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());

        {
            let index = VectorIndex::open(&path, embedder.clone()).unwrap();
            index.index_content("site-a", "index.html", "<h1>Portfolio</h1>").await.unwrap();
        }

        let reopened = VectorIndex::open(&path, embedder).unwrap();
        let fragments = reopened.fragments_for("site-a", "index.html");
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].text, "<h1>Portfolio</h1>");

        // Sequence numbers keep growing after a reload.
        reopened.index_content("site-a", "app.js", "let x = 1;").await.unwrap();
        let js = reopened.fragments_for("site-a", "app.js");
        assert!(js[0].seq > fragments[0].seq);
    }

    #[tokio::test]
    async fn test_model_change_discards_fragments() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("fragments.json");

        {
            let index = VectorIndex::open(&path, Arc::new(HashEmbedder::new(64))).unwrap();
            index.index_content("p", "a.css", "a { }").await.unwrap();
        }

        let reopened = VectorIndex::open(&path, Arc::new(HashEmbedder::new(128))).unwrap();
        assert!(reopened.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_state_untouched() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("index");
        let index = VectorIndex::open(dir.join("fragments.json"), Arc::new(HashEmbedder::default())).unwrap();
        index.index_content("p", "a.css", "a { color: red; }").await.unwrap();
        let revision = index.revision();

        // A plain file where the directory was makes every commit fail.
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, "x").unwrap();

        let result = index.index_content("p", "b.css", "b { color: blue; }").await;
        assert!(matches!(result, Err(IndexError::Lock { .. })));
        assert!(index.fragments_for("p", "b.css").is_empty());
        assert_eq!(index.files("p"), vec!["a.css".to_string()]);
        assert_eq!(index.revision(), revision);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("fragments.json");
        std::fs::write(&path, "{not json").unwrap();

        let result = VectorIndex::open(&path, Arc::new(HashEmbedder::default()));
        assert!(matches!(result, Err(IndexError::Corrupt { .. })));
    }
}
