//! On-disk project directories.
//!
//! Each session owns one directory under the output root. Writes replace
//! files atomically and remember the previous content so a failed turn can
//! be rolled back.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use smith_index::{is_indexable, normalize_rel_path, write_atomic};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{ChatError, ChatResult};
use crate::prompt::is_safe_relative_path;
use crate::types::ProjectFileEntry;

/// Largest file passed back to the model as current content.
const MAX_PRIOR_FILE_BYTES: u64 = 256 * 1024;

/// Deterministic project id for a session.
///
/// Session ids are already restricted to filesystem-safe characters, so the
/// id is used as-is after a fixed prefix.
pub fn project_id_for_session(session_id: &str) -> String {
    format!("site-{}", session_id)
}

/// Files written in one turn, with what they replaced.
#[derive(Debug)]
pub struct WriteBatch {
    root: PathBuf,
    entries: Vec<(String, Option<Vec<u8>>)>,
}

impl WriteBatch {
    /// Relative paths written, in write order.
    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|(p, _)| p.clone()).collect()
    }

    /// Project directory the batch wrote into.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Access to project directories under one output root.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    output_dir: PathBuf,
}

impl ProjectStore {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.output_dir.join(project_id)
    }

    /// Whether the project directory exists.
    pub fn exists(&self, project_id: &str) -> bool {
        is_valid_project_id(project_id) && self.project_dir(project_id).is_dir()
    }

    /// Project directories under the output root, sorted.
    pub fn list_projects(&self) -> ChatResult<Vec<String>> {
        if !self.output_dir.exists() {
            return Ok(Vec::new());
        }
        let mut projects = Vec::new();
        for entry in fs::read_dir(&self.output_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if is_valid_project_id(name) {
                        projects.push(name.to_string());
                    }
                }
            }
        }
        projects.sort();
        Ok(projects)
    }

    /// Read one file of a project.
    ///
    /// Missing projects, missing files and paths escaping the project are all
    /// [`ChatError::NotFound`].
    pub fn read_file(&self, project_id: &str, rel_path: &str) -> ChatResult<Vec<u8>> {
        let path = self.resolve(project_id, rel_path)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found(project_id, rel_path)),
            Err(e) if path.is_dir() => {
                debug!(error = %e, "Requested path is a directory");
                Err(not_found(project_id, rel_path))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every file of a project with its size, sorted by path.
    pub fn list_files(&self, project_id: &str) -> ChatResult<Vec<ProjectFileEntry>> {
        if !self.exists(project_id) {
            return Err(ChatError::NotFound(format!("Project {}", project_id)));
        }
        let root = self.project_dir(project_id);
        let mut files: Vec<ProjectFileEntry> = WalkDir::new(&root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let rel = e.path().strip_prefix(&root).ok().map(normalize_rel_path)?;
                let size = e.metadata().map(|m| m.len()).unwrap_or(0);
                Some(ProjectFileEntry { path: rel, size })
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Text content of the project's site files, for the model's context.
    pub fn read_site_files(&self, project_id: &str) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        let Ok(entries) = self.list_files(project_id) else {
            return files;
        };
        let root = self.project_dir(project_id);
        for entry in entries {
            if entry.size > MAX_PRIOR_FILE_BYTES || !is_indexable(Path::new(&entry.path)) {
                continue;
            }
            match fs::read_to_string(root.join(&entry.path)) {
                Ok(content) => {
                    files.insert(entry.path, content);
                }
                Err(e) => warn!(project_id, path = %entry.path, error = %e, "Skipping unreadable project file"),
            }
        }
        files
    }

    /// Write `files` into the project, creating it if needed.
    ///
    /// On any failure the files already written in this call are restored
    /// before the error is returned.
    pub fn write_files(&self, project_id: &str, files: &BTreeMap<String, String>) -> ChatResult<WriteBatch> {
        if !is_valid_project_id(project_id) {
            return Err(ChatError::Validation(format!("Invalid project id: {}", project_id)));
        }
        let root = self.project_dir(project_id);
        fs::create_dir_all(&root).map_err(|e| ChatError::Persistence(format!("Failed to create {}: {}", root.display(), e)))?;

        let mut batch = WriteBatch {
            root: root.clone(),
            entries: Vec::with_capacity(files.len()),
        };

        for (rel_path, content) in files {
            if !is_safe_relative_path(rel_path) {
                self.rollback(&batch);
                return Err(ChatError::Validation(format!("Unsafe file path: {}", rel_path)));
            }
            let path = root.join(rel_path);
            let previous = match fs::read(&path) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => {
                    self.rollback(&batch);
                    return Err(ChatError::Persistence(format!("Failed to read {}: {}", path.display(), e)));
                }
            };
            if let Err(e) = write_atomic(&path, content.as_bytes()) {
                self.rollback(&batch);
                return Err(ChatError::Persistence(format!("Failed to write {}: {}", path.display(), e)));
            }
            batch.entries.push((rel_path.clone(), previous));
        }

        debug!(project_id, files = batch.entries.len(), "Wrote project files");
        Ok(batch)
    }

    /// Restore every file of `batch` to its previous state.
    ///
    /// Best effort: failures are logged and the remaining files still restored.
    pub fn rollback(&self, batch: &WriteBatch) {
        for (rel_path, previous) in batch.entries.iter().rev() {
            let path = batch.root.join(rel_path);
            let result = match previous {
                Some(bytes) => write_atomic(&path, bytes),
                None => match fs::remove_file(&path) {
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "Failed to roll back project file");
            }
        }
    }

    /// Delete a project directory. Returns whether anything was removed.
    pub fn remove_project(&self, project_id: &str) -> ChatResult<bool> {
        if !is_valid_project_id(project_id) {
            return Ok(false);
        }
        let root = self.project_dir(project_id);
        match fs::remove_dir_all(&root) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ChatError::Persistence(format!("Failed to remove {}: {}", root.display(), e))),
        }
    }

    fn resolve(&self, project_id: &str, rel_path: &str) -> ChatResult<PathBuf> {
        let rel_path = rel_path.trim_start_matches("./");
        if !is_valid_project_id(project_id) || !is_safe_relative_path(rel_path) {
            return Err(not_found(project_id, rel_path));
        }
        Ok(self.project_dir(project_id).join(rel_path))
    }
}

fn is_valid_project_id(project_id: &str) -> bool {
    !project_id.contains('/') && is_safe_relative_path(project_id)
}

fn not_found(project_id: &str, rel_path: &str) -> ChatError {
    ChatError::NotFound(format!("{}/{}", project_id, rel_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_write_then_read_is_byte_identical() {
        let temp = tempdir().unwrap();
        let store = ProjectStore::new(temp.path());
        let content = "<!doctype html>\n<h1>Café ☕</h1>\n";
        store.write_files("site-s1", &files(&[("index.html", content)])).unwrap();

        assert_eq!(store.read_file("site-s1", "index.html").unwrap(), content.as_bytes());
        assert!(store.exists("site-s1"));
    }

    #[test]
    fn test_read_rejects_missing_and_unsafe() {
        let temp = tempdir().unwrap();
        let store = ProjectStore::new(temp.path());
        store.write_files("site-s1", &files(&[("index.html", "x")])).unwrap();
        std::fs::write(temp.path().join("secret.txt"), "s").unwrap();

        assert!(matches!(store.read_file("site-s1", "missing.css"), Err(ChatError::NotFound(_))));
        assert!(matches!(store.read_file("site-s1", "../secret.txt"), Err(ChatError::NotFound(_))));
        assert!(matches!(store.read_file("..", "secret.txt"), Err(ChatError::NotFound(_))));
        assert!(matches!(store.read_file("nope", "index.html"), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn test_rollback_restores_and_deletes() {
        let temp = tempdir().unwrap();
        let store = ProjectStore::new(temp.path());
        store.write_files("p", &files(&[("styles.css", "old")])).unwrap();

        let batch = store
            .write_files("p", &files(&[("styles.css", "new"), ("app.js", "let x;")]))
            .unwrap();
        assert_eq!(batch.paths(), vec!["app.js".to_string(), "styles.css".to_string()]);

        store.rollback(&batch);
        assert_eq!(store.read_file("p", "styles.css").unwrap(), b"old");
        assert!(matches!(store.read_file("p", "app.js"), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn test_list_files_and_site_files() {
        let temp = tempdir().unwrap();
        let store = ProjectStore::new(temp.path());
        store
            .write_files(
                "p",
                &files(&[("index.html", "<p>hi</p>"), ("assets/logo.svg", "<svg/>"), ("app.js", "1;")]),
            )
            .unwrap();

        let listed = store.list_files("p").unwrap();
        let paths: Vec<&str> = listed.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["app.js", "assets/logo.svg", "index.html"]);
        assert_eq!(listed[2].size, 9);

        let site = store.read_site_files("p");
        assert_eq!(site.keys().collect::<Vec<_>>(), vec!["app.js", "index.html"]);

        assert!(matches!(store.list_files("missing"), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn test_remove_project_is_idempotent() {
        let temp = tempdir().unwrap();
        let store = ProjectStore::new(temp.path());
        store.write_files("p", &files(&[("index.html", "x")])).unwrap();

        assert!(store.remove_project("p").unwrap());
        assert!(!store.remove_project("p").unwrap());
        assert!(store.list_projects().unwrap().is_empty());
    }

    #[test]
    fn test_project_id_for_session() {
        assert_eq!(project_id_for_session("s1"), "site-s1");
    }
}
