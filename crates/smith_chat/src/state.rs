//! Conversation state store.
//!
//! Sessions are stored under the data directory:
//! `<data_dir>/sessions/<sessionId>/`
//!
//! Directory structure:
//! ```text
//! sessions/<sessionId>/
//! ├── checkpoint.json    # Latest workflow checkpoint (replaced atomically)
//! └── audit.jsonl        # One line per finished, failed or interrupted turn
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use smith_index::write_atomic;
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};
use crate::types::{AuditEntry, Checkpoint, SessionSummary};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const AUDIT_FILE: &str = "audit.jsonl";

/// Reject session ids that are empty or unsafe as a directory name.
pub fn validate_session_id(session_id: &str) -> ChatResult<()> {
    if session_id.trim().is_empty() {
        return Err(ChatError::Validation("Session id must not be empty".to_string()));
    }
    if session_id == "." || session_id == ".." {
        return Err(ChatError::Validation(format!("Invalid session id: {}", session_id)));
    }
    let valid = session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid {
        return Err(ChatError::Validation(format!(
            "Invalid session id '{}': use letters, digits, '-', '_' or '.'",
            session_id
        )));
    }
    Ok(())
}

/// Durable checkpoint storage keyed by session id.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Create a store rooted at the sessions directory
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Replace the latest checkpoint of a session.
    ///
    /// Readers see the previous or the new checkpoint, never a partial one.
    /// A failed write is retried once.
    pub fn save(&self, session_id: &str, checkpoint: &Checkpoint) -> ChatResult<()> {
        validate_session_id(session_id)?;
        let content = serde_json::to_vec_pretty(checkpoint)?;
        let path = self.session_dir(session_id).join(CHECKPOINT_FILE);

        if let Err(first) = write_atomic(&path, &content) {
            warn!(session_id, error = %first, "Checkpoint write failed, retrying once");
            write_atomic(&path, &content).map_err(|e| {
                ChatError::Persistence(format!("Failed to save checkpoint for {}: {}", session_id, e))
            })?;
        }
        debug!(session_id, stage = %checkpoint.stage, "Saved checkpoint");
        Ok(())
    }

    /// Latest checkpoint, or `None` for a session never saved.
    pub fn load(&self, session_id: &str) -> ChatResult<Option<Checkpoint>> {
        validate_session_id(session_id)?;
        let path = self.session_dir(session_id).join(CHECKPOINT_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint = serde_json::from_str(&content).map_err(|e| {
            ChatError::Persistence(format!("Corrupt checkpoint {}: {}", path.display(), e))
        })?;
        Ok(Some(checkpoint))
    }

    /// Remove all state of a session. Unknown sessions are a no-op.
    pub fn clear(&self, session_id: &str) -> ChatResult<()> {
        validate_session_id(session_id)?;
        match fs::remove_dir_all(self.session_dir(session_id)) {
            Ok(()) => {
                debug!(session_id, "Cleared session state");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChatError::Persistence(format!("Failed to clear session {}: {}", session_id, e))),
        }
    }

    /// Append a line to the session's audit log.
    pub fn append_audit(&self, session_id: &str, entry: &AuditEntry) -> ChatResult<()> {
        validate_session_id(session_id)?;
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(AUDIT_FILE))?;

        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json)?;

        Ok(())
    }

    /// All audit entries of a session, oldest first.
    ///
    /// A torn final line from an interrupted append is skipped.
    pub fn load_audit(&self, session_id: &str) -> ChatResult<Vec<AuditEntry>> {
        validate_session_id(session_id)?;
        let path = self.session_dir(session_id).join(AUDIT_FILE);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(session_id, error = %e, "Skipping malformed audit line"),
            }
        }

        Ok(entries)
    }

    /// List all sessions with a checkpoint, most recently updated first.
    pub fn list_sessions(&self) -> ChatResult<Vec<SessionSummary>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir() {
                if let Some(id) = path.file_name().and_then(|n| n.to_str()) {
                    match self.load(id) {
                        Ok(Some(checkpoint)) => sessions.push(SessionSummary {
                            id: checkpoint.session.id.clone(),
                            project_id: checkpoint.session.project_id.clone(),
                            stage: checkpoint.stage,
                            turns: checkpoint.messages.len(),
                            created_at: checkpoint.session.created_at,
                            updated_at: checkpoint.updated_at,
                        }),
                        Ok(None) => {}
                        Err(e) => warn!(session_id = id, error = %e, "Skipping unreadable session"),
                    }
                }
            }
        }

        // Sort by updated_at descending
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Intent, SessionInfo, Turn, TurnOutcome, WorkflowStage};
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn checkpoint(id: &str) -> Checkpoint {
        let mut cp = Checkpoint::new(SessionInfo {
            id: id.to_string(),
            project_id: format!("site-{}", id),
            project_dir: PathBuf::from("generated_apps").join(format!("site-{}", id)),
            created_at: Utc::now(),
        });
        cp.messages.push(Turn::user(0, "Build me a portfolio site"));
        cp.stage = WorkflowStage::Generating;
        cp.intent = Some(Intent::Build);
        cp.pending_context.push("// site-x/styles.css (chunk 0)\nbody {}".to_string());
        cp
    }

    #[test]
    fn test_load_after_save_is_equal() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        let cp = checkpoint("s1");

        store.save("s1", &cp).unwrap();
        assert_eq!(store.load("s1").unwrap(), Some(cp.clone()));

        // A second store over the same directory sees the same state.
        let reopened = StateStore::new(temp.path());
        assert_eq!(reopened.load("s1").unwrap(), Some(cp));
    }

    #[test]
    fn test_unseen_session_is_none() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        assert_eq!(store.load("never").unwrap(), None);
    }

    #[test]
    fn test_clear_is_noop_when_absent() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        store.clear("ghost").unwrap();

        store.save("s1", &checkpoint("s1")).unwrap();
        store.clear("s1").unwrap();
        assert_eq!(store.load("s1").unwrap(), None);
        assert!(store.load_audit("s1").unwrap().is_empty());
    }

    #[test]
    fn test_session_id_validation() {
        assert!(validate_session_id("s1").is_ok());
        assert!(validate_session_id("user_42.draft-2").is_ok());
        for bad in ["", "  ", ".", "..", "a/b", "a b", "x\\y"] {
            assert!(matches!(validate_session_id(bad), Err(ChatError::Validation(_))), "{}", bad);
        }
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        assert!(matches!(store.load("../etc"), Err(ChatError::Validation(_))));
    }

    #[test]
    fn test_audit_log_appends() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        for (ordinal, outcome) in [(0, TurnOutcome::Completed), (2, TurnOutcome::Failed)] {
            store
                .append_audit(
                    "s1",
                    &AuditEntry {
                        ordinal,
                        intent: Some(Intent::Edit),
                        outcome,
                        files: vec!["styles.css".to_string()],
                        error: None,
                        at: Utc::now(),
                    },
                )
                .unwrap();
        }
        // Simulate a torn trailing write.
        let mut file = OpenOptions::new()
            .append(true)
            .open(temp.path().join("s1").join(AUDIT_FILE))
            .unwrap();
        write!(file, "{{\"ordinal\": 4, \"outc").unwrap();

        let audit = store.load_audit("s1").unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].outcome, TurnOutcome::Failed);
    }

    #[test]
    fn test_list_sessions_sorted_by_update() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());

        let mut older = checkpoint("older");
        older.updated_at = Utc::now() - Duration::hours(1);
        let newer = checkpoint("newer");
        store.save("older", &older).unwrap();
        store.save("newer", &newer).unwrap();
        std::fs::create_dir_all(temp.path().join("empty")).unwrap();

        let sessions = store.list_sessions().unwrap();
        let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
        assert_eq!(sessions[0].turns, 1);
    }

    #[test]
    fn test_corrupt_checkpoint_is_persistence_error() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        std::fs::create_dir_all(temp.path().join("s1")).unwrap();
        std::fs::write(temp.path().join("s1").join(CHECKPOINT_FILE), "{").unwrap();
        assert!(matches!(store.load("s1"), Err(ChatError::Persistence(_))));
    }
}
