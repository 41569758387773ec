//! Site agent workflow.
//!
//! A message moves through explicit stages:
//!
//! ```text
//! idle -> classifying -> retrieving -> generating -> writing -> responding -> idle
//! ```
//!
//! The session checkpoint is saved at every transition. A checkpoint found
//! outside `idle` on load belongs to a turn interrupted by a process exit and
//! is recovered before the next message is handled.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use smith_index::{is_indexable, PathLocks, VectorIndex};
use smith_watch::ProjectWatcher;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, SmithConfig};
use crate::error::{ChatError, ChatResult};
use crate::llm::{GenerationClient, GenerationRequest};
use crate::project::{project_id_for_session, ProjectStore};
use crate::prompt::fill_missing_conventional;
use crate::search::{outline_html, PageFetcher, SearchHit, WebSearch};
use crate::state::{validate_session_id, StateStore};
use crate::types::{
    AuditEntry, ChatReply, Checkpoint, FailureRecord, Intent, MessageRole, ProjectFileEntry, ReconcileReport, SessionInfo,
    SessionStatus, SessionSummary, Turn, TurnOutcome, WorkflowStage,
};

const BUILD_REPLY: &str = "I've created a new project. You can see it in the preview.";
const EDIT_REPLY: &str = "I have applied the updates to the project.";

/// Result of classifying a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub intent: Intent,
    /// Message asks for images, logos or similar assets
    pub wants_assets: bool,
    /// First external URL in the message
    pub reference_url: Option<String>,
}

/// Classify a message.
///
/// Without a project every message is a build. With one, a message carrying
/// an external URL is a clone, anything else an edit.
pub fn classify_message(text: &str, has_project: bool) -> Classification {
    let reference_url = find_url(text);
    let intent = match (has_project, reference_url.is_some()) {
        (false, _) => Intent::Build,
        (true, true) => Intent::Clone,
        (true, false) => Intent::Edit,
    };
    Classification {
        intent,
        wants_assets: mentions_assets(text),
        reference_url,
    }
}

static URL_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'`]+"#).ok());

static ASSET_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(images?|photos?|pictures?|logos?|icons?|illustrations?|gallery|galleries)\b").ok()
});

fn find_url(text: &str) -> Option<String> {
    let found = URL_RE.as_ref()?.find(text)?;
    let url = found
        .as_str()
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')' | ']'));
    Some(url.to_string())
}

fn mentions_assets(text: &str) -> bool {
    ASSET_RE.as_ref().is_some_and(|re| re.is_match(text))
}

/// One async mutex per session. Waiters are served in arrival order.
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, session_id: &str, queue: bool) -> ChatResult<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        if queue {
            Ok(lock.lock_owned().await)
        } else {
            lock.try_lock_owned()
                .map_err(|_| ChatError::SessionBusy(session_id.to_string()))
        }
    }

    /// Drop the entry of a session nobody holds or waits for.
    fn forget(&self, session_id: &str) {
        let mut locks = self.locks.lock();
        if locks.get(session_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(session_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Conversational site generation agent.
///
/// Shared across sessions; wrap in an `Arc` to serve several at once.
pub struct SiteAgent {
    config: AgentConfig,
    state: StateStore,
    projects: ProjectStore,
    index: Arc<VectorIndex>,
    locks: PathLocks,
    generator: Arc<dyn GenerationClient>,
    search: Option<Arc<dyn WebSearch>>,
    fetcher: Option<Arc<dyn PageFetcher>>,
    watcher: Option<Arc<ProjectWatcher>>,
    sessions: SessionLocks,
}

impl SiteAgent {
    pub fn new(
        config: AgentConfig,
        state: StateStore,
        projects: ProjectStore,
        index: Arc<VectorIndex>,
        locks: PathLocks,
        generator: Arc<dyn GenerationClient>,
    ) -> Self {
        Self {
            config,
            state,
            projects,
            index,
            locks,
            generator,
            search: None,
            fetcher: None,
            watcher: None,
            sessions: SessionLocks::default(),
        }
    }

    /// Build an agent over the directories and index named by `config`.
    pub fn from_config(config: &SmithConfig, generator: Arc<dyn GenerationClient>) -> ChatResult<Self> {
        let embedder = config.embeddings.build_embedder()?;
        let index = VectorIndex::open(config.paths.index_path(), embedder)?;
        Ok(Self::new(
            config.agent.clone(),
            StateStore::new(config.paths.sessions_dir()),
            ProjectStore::new(&config.paths.output_dir),
            Arc::new(index),
            PathLocks::new(),
            generator,
        ))
    }

    pub fn with_search(mut self, search: Arc<dyn WebSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Register new projects with `watcher` and drop their watches on clear.
    pub fn with_watcher(mut self, watcher: Arc<ProjectWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn index(&self) -> Arc<VectorIndex> {
        Arc::clone(&self.index)
    }

    pub fn locks(&self) -> PathLocks {
        self.locks.clone()
    }

    pub fn projects(&self) -> &ProjectStore {
        &self.projects
    }

    /// Handle one user message.
    ///
    /// Invalid input is returned as [`ChatError::Validation`] before anything
    /// is touched. Once the message is accepted, failures of the turn come
    /// back as an `Ok` reply with [`ChatReply::failure`] set, after the
    /// failure has been checkpointed.
    pub async fn handle_message(&self, session_id: &str, text: &str) -> ChatResult<ChatReply> {
        validate_session_id(session_id)?;
        let message = text.trim();
        if message.is_empty() {
            return Err(ChatError::Validation("Message must not be empty".to_string()));
        }

        let _session = self.sessions.acquire(session_id, self.config.queue_messages).await?;

        let mut checkpoint = self.load_or_create(session_id).await?;
        let ordinal = checkpoint.next_ordinal();
        checkpoint.messages.push(Turn::user(ordinal, message));
        info!(session_id, ordinal, "Handling message");

        match self.run_turn(&mut checkpoint, message).await {
            Ok(reply) => Ok(reply),
            Err(err) => self.fail_turn(&mut checkpoint, ordinal, err),
        }
    }

    /// Boundary form of [`SiteAgent::handle_message`]: every outcome is a reply.
    pub async fn chat(&self, session_id: &str, text: &str) -> ChatReply {
        match self.handle_message(session_id, text).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(session_id, error = %err, "Message rejected");
                let project_id = project_id_for_session(session_id);
                let exists = validate_session_id(session_id).is_ok() && self.projects.exists(&project_id);
                ChatReply {
                    reply_text: failure_text(&err),
                    project_id: exists.then(|| project_id.clone()),
                    project_path: exists.then(|| self.projects.project_dir(&project_id)),
                    files: Vec::new(),
                    intent: None,
                    failure: Some(err.category().to_string()),
                }
            }
        }
    }

    async fn run_turn(&self, checkpoint: &mut Checkpoint, message: &str) -> ChatResult<ChatReply> {
        let session_id = checkpoint.session.id.clone();
        let project_id = checkpoint.session.project_id.clone();

        // Classifying
        self.transition(checkpoint, WorkflowStage::Classifying)?;
        let classification = classify_message(message, self.projects.exists(&project_id));
        debug!(
            session_id = %session_id,
            intent = %classification.intent,
            wants_assets = classification.wants_assets,
            "Classified message"
        );
        checkpoint.intent = Some(classification.intent);
        checkpoint.wants_assets = classification.wants_assets;
        checkpoint.reference_url = classification.reference_url.clone();

        // Retrieving
        self.transition(checkpoint, WorkflowStage::Retrieving)?;
        checkpoint.pending_context = self.gather_context(&project_id, message, &classification).await;

        // Generating
        self.transition(checkpoint, WorkflowStage::Generating)?;
        let prior_files = match classification.intent {
            Intent::Build => BTreeMap::new(),
            Intent::Edit | Intent::Clone => self.projects.read_site_files(&project_id),
        };
        let request = GenerationRequest {
            intent: classification.intent,
            instruction: message.to_string(),
            context: checkpoint.pending_context.clone(),
            history: recent_history(&checkpoint.messages, self.config.history_turns),
            prior_files,
        };

        let timeout = self.config.generation_timeout();
        let mut output = match tokio::time::timeout(timeout, self.generator.generate(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ChatError::Model(format!(
                    "Generation timed out after {}s",
                    timeout.as_secs()
                )))
            }
        };
        if classification.intent == Intent::Build {
            let filled = fill_missing_conventional(&mut output.files);
            if !filled.is_empty() {
                warn!(session_id = %session_id, files = ?filled, "Model omitted conventional files");
            }
        }

        // Writing
        self.transition(checkpoint, WorkflowStage::Writing)?;
        let written = self.write_and_index(&project_id, &output.files).await?;
        self.ensure_watched(&project_id);

        // Responding
        self.transition(checkpoint, WorkflowStage::Responding)?;
        let reply_text = if output.explanation.trim().is_empty() {
            match classification.intent {
                Intent::Build => BUILD_REPLY.to_string(),
                Intent::Edit | Intent::Clone => EDIT_REPLY.to_string(),
            }
        } else {
            output.explanation.trim().to_string()
        };

        let user_ordinal = checkpoint.next_ordinal() - 1;
        let ordinal = checkpoint.next_ordinal();
        checkpoint
            .messages
            .push(Turn::assistant(ordinal, reply_text.clone(), written.clone()));
        self.audit(
            &session_id,
            AuditEntry {
                ordinal: user_ordinal,
                intent: Some(classification.intent),
                outcome: TurnOutcome::Completed,
                files: written.clone(),
                error: None,
                at: Utc::now(),
            },
        );
        checkpoint.reset_turn();
        checkpoint.updated_at = Utc::now();
        self.state.save(&session_id, checkpoint)?;

        info!(
            session_id = %session_id,
            project_id = %project_id,
            intent = %classification.intent,
            files = written.len(),
            "Turn completed"
        );

        Ok(ChatReply {
            reply_text,
            project_id: Some(project_id.clone()),
            project_path: Some(self.projects.project_dir(&project_id)),
            files: written,
            intent: Some(classification.intent),
            failure: None,
        })
    }

    fn transition(&self, checkpoint: &mut Checkpoint, stage: WorkflowStage) -> ChatResult<()> {
        checkpoint.stage = stage;
        checkpoint.updated_at = Utc::now();
        self.state.save(&checkpoint.session.id, checkpoint)
    }

    /// Assemble prompt context: fragments, then search hits, then the
    /// reference page outline. Failures degrade to less context.
    async fn gather_context(&self, project_id: &str, message: &str, classification: &Classification) -> Vec<String> {
        let scope = match classification.intent {
            Intent::Build => None,
            Intent::Edit | Intent::Clone => Some(project_id),
        };

        let mut context: Vec<String> = match self.index.query(message, self.config.top_k, scope).await {
            Ok(fragments) => fragments.iter().map(|f| f.render()).collect(),
            Err(e) => {
                let err = ChatError::Retrieval(e.to_string());
                warn!(project_id, error = %err, "Continuing without retrieved context");
                Vec::new()
            }
        };

        if classification.wants_assets {
            if let Some(search) = &self.search {
                let query = format!("images for: {}", message);
                match search.search(&query).await {
                    Ok(hits) if !hits.is_empty() => context.push(render_hits(&hits)),
                    Ok(_) => debug!(project_id, "Asset search returned no results"),
                    Err(e) => warn!(project_id, error = %e, "Asset search failed, continuing without it"),
                }
            }
        }

        if let (Some(url), Some(fetcher)) = (&classification.reference_url, &self.fetcher) {
            match fetcher.fetch(url).await {
                Ok(html) => context.push(outline_html(&html).render(url)),
                Err(e) => warn!(project_id, url = %url, error = %e, "Reference page fetch failed, continuing without it"),
            }
        }

        context
    }

    /// Write the generated files and index them under their path locks.
    ///
    /// If indexing fails the files are restored and re-synchronised, so the
    /// project and the index never disagree.
    async fn write_and_index(&self, project_id: &str, files: &BTreeMap<String, String>) -> ChatResult<Vec<String>> {
        let guard = self.locks.lock_many(project_id, files.keys().map(String::as_str)).await;

        let batch = self.projects.write_files(project_id, files)?;

        for (path, content) in files {
            if !is_indexable(Path::new(path)) {
                continue;
            }
            if let Err(e) = self.index.index_content(project_id, path, content).await {
                warn!(project_id, path = %path, error = %e, "Indexing failed, rolling back written files");
                self.projects.rollback(&batch);
                for restored in batch.paths() {
                    if let Err(e) = self.index.index_file(project_id, batch.root(), &restored).await {
                        warn!(project_id, path = %restored, error = %e, "Failed to re-sync restored file");
                    }
                }
                return Err(ChatError::Persistence(format!("Failed to index {}: {}", path, e)));
            }
        }

        drop(guard);
        Ok(batch.paths())
    }

    fn ensure_watched(&self, project_id: &str) {
        if let Some(watcher) = &self.watcher {
            if !watcher.is_watching(project_id) {
                if let Err(e) = watcher.watch(project_id, &self.projects.project_dir(project_id)) {
                    warn!(project_id, error = %e, "Failed to watch project");
                }
            }
        }
    }

    /// Record a failed turn and answer with a failure reply.
    fn fail_turn(&self, checkpoint: &mut Checkpoint, user_ordinal: usize, err: ChatError) -> ChatResult<ChatReply> {
        let session_id = checkpoint.session.id.clone();
        let project_id = checkpoint.session.project_id.clone();
        let stage = checkpoint.stage;
        let category = err.category();
        warn!(session_id = %session_id, stage = %stage, category, error = %err, "Turn failed");

        let reply_text = failure_text(&err);
        checkpoint.last_failure = Some(FailureRecord {
            ordinal: user_ordinal,
            stage,
            category: category.to_string(),
            message: err.to_string(),
            at: Utc::now(),
        });
        let ordinal = checkpoint.next_ordinal();
        checkpoint
            .messages
            .push(Turn::assistant(ordinal, reply_text.clone(), Vec::new()));
        self.audit(
            &session_id,
            AuditEntry {
                ordinal: user_ordinal,
                intent: checkpoint.intent,
                outcome: TurnOutcome::Failed,
                files: Vec::new(),
                error: Some(err.to_string()),
                at: Utc::now(),
            },
        );
        let intent = checkpoint.intent;
        checkpoint.reset_turn();
        checkpoint.updated_at = Utc::now();
        self.state.save(&session_id, checkpoint)?;

        let exists = self.projects.exists(&project_id);
        Ok(ChatReply {
            reply_text,
            project_id: exists.then(|| project_id.clone()),
            project_path: exists.then(|| self.projects.project_dir(&project_id)),
            files: Vec::new(),
            intent,
            failure: Some(category.to_string()),
        })
    }

    fn audit(&self, session_id: &str, entry: AuditEntry) {
        if let Err(e) = self.state.append_audit(session_id, &entry) {
            warn!(session_id, error = %e, "Failed to append audit entry");
        }
    }

    async fn load_or_create(&self, session_id: &str) -> ChatResult<Checkpoint> {
        match self.state.load(session_id)? {
            Some(mut checkpoint) => {
                if checkpoint.stage != WorkflowStage::Idle {
                    self.recover(&mut checkpoint).await?;
                }
                Ok(checkpoint)
            }
            None => {
                let project_id = project_id_for_session(session_id);
                debug!(session_id, project_id = %project_id, "Creating session");
                Ok(Checkpoint::new(SessionInfo {
                    id: session_id.to_string(),
                    project_dir: self.projects.project_dir(&project_id),
                    project_id,
                    created_at: Utc::now(),
                }))
            }
        }
    }

    /// Close out a turn interrupted by a process exit.
    async fn recover(&self, checkpoint: &mut Checkpoint) -> ChatResult<()> {
        let session_id = checkpoint.session.id.clone();
        let project_id = checkpoint.session.project_id.clone();
        let stage = checkpoint.stage;
        warn!(session_id = %session_id, stage = %stage, "Recovering interrupted turn");

        let user_ordinal = checkpoint
            .messages
            .iter()
            .rev()
            .find(|t| t.role == MessageRole::User)
            .map(|t| t.ordinal)
            .unwrap_or(0);

        if stage >= WorkflowStage::Writing {
            let root = self.projects.project_dir(&project_id);
            match self.index.sync_tree(&project_id, &root).await {
                Ok(report) => debug!(
                    project_id = %project_id,
                    indexed = report.indexed,
                    removed = report.removed,
                    "Re-synced project after interruption"
                ),
                Err(e) => warn!(project_id = %project_id, error = %e, "Failed to re-sync project after interruption"),
            }
        }

        self.audit(
            &session_id,
            AuditEntry {
                ordinal: user_ordinal,
                intent: checkpoint.intent,
                outcome: TurnOutcome::Interrupted,
                files: Vec::new(),
                error: Some(format!("Interrupted while {}", stage)),
                at: Utc::now(),
            },
        );
        checkpoint.last_failure = Some(FailureRecord {
            ordinal: user_ordinal,
            stage,
            category: "interrupted".to_string(),
            message: format!("Turn interrupted while {}", stage),
            at: Utc::now(),
        });
        checkpoint.reset_turn();
        checkpoint.updated_at = Utc::now();
        self.state.save(&session_id, checkpoint)
    }

    /// Discard a session: its project, fragments, watch and state.
    ///
    /// Safe on sessions that never existed. Re-index work of the watcher
    /// that is already running for the project is waited for, so nothing
    /// it indexes survives the clear.
    pub async fn clear_session(&self, session_id: &str) -> ChatResult<()> {
        validate_session_id(session_id)?;
        let session = self.sessions.acquire(session_id, true).await?;

        let project_id = project_id_for_session(session_id);
        if let Some(watcher) = &self.watcher {
            watcher.unwatch(&project_id);
        }
        let project = self.locks.lock_project(&project_id).await;
        let removed_dir = self.projects.remove_project(&project_id)?;
        let removed_fragments = self.index.remove(&project_id, None)?;
        self.state.clear(session_id)?;
        drop(project);
        self.locks.forget_project(&project_id);
        drop(session);
        self.sessions.forget(session_id);

        info!(
            session_id,
            project_id = %project_id,
            removed_dir,
            removed_fragments,
            "Cleared session"
        );
        Ok(())
    }

    /// Conversation turns of a session, oldest first.
    pub fn history(&self, session_id: &str) -> ChatResult<Vec<Turn>> {
        Ok(self
            .state
            .load(session_id)?
            .map(|checkpoint| checkpoint.messages)
            .unwrap_or_default())
    }

    pub fn session_status(&self, session_id: &str) -> ChatResult<SessionStatus> {
        let checkpoint = self
            .state
            .load(session_id)?
            .ok_or_else(|| ChatError::NotFound(format!("Session {}", session_id)))?;
        let project_id = checkpoint.session.project_id.clone();

        Ok(SessionStatus {
            id: checkpoint.session.id.clone(),
            project_exists: self.projects.exists(&project_id),
            project_path: self.projects.project_dir(&project_id),
            indexed_files: self.index.files(&project_id),
            project_id,
            stage: checkpoint.stage,
            turns: checkpoint.messages.len(),
            last_failure: checkpoint.last_failure,
            updated_at: checkpoint.updated_at,
        })
    }

    pub fn list_sessions(&self) -> ChatResult<Vec<SessionSummary>> {
        self.state.list_sessions()
    }

    /// Raw bytes of one project file.
    pub fn get_project_file(&self, project_id: &str, rel_path: &str) -> ChatResult<Vec<u8>> {
        self.projects.read_file(project_id, rel_path)
    }

    /// Every file of a project, for packaging.
    pub fn project_files(&self, project_id: &str) -> ChatResult<Vec<ProjectFileEntry>> {
        self.projects.list_files(project_id)
    }

    pub fn project_path(&self, project_id: &str) -> PathBuf {
        self.projects.project_dir(project_id)
    }

    /// Bring the index in line with the project directories on disk.
    ///
    /// Run at startup: every project tree is re-synchronised, fragments of
    /// projects without a directory are dropped, and projects are watched
    /// when a watcher is attached.
    pub async fn reconcile(&self) -> ChatResult<ReconcileReport> {
        let projects = self.projects.list_projects()?;
        let mut report = ReconcileReport {
            projects: projects.len(),
            ..ReconcileReport::default()
        };

        for project_id in &projects {
            let root = self.projects.project_dir(project_id);
            match self.index.sync_tree(project_id, &root).await {
                Ok(sync) => {
                    report.files_indexed += sync.indexed;
                    report.files_removed += sync.removed;
                }
                Err(e) => warn!(project_id = %project_id, error = %e, "Failed to sync project"),
            }
            if let Some(watcher) = &self.watcher {
                match watcher.watch(project_id, &root) {
                    Ok(()) => report.watched += 1,
                    Err(e) => warn!(project_id = %project_id, error = %e, "Failed to watch project"),
                }
            }
        }

        for indexed in self.index.projects() {
            if !projects.contains(&indexed) {
                self.index.remove(&indexed, None)?;
                report.orphans_dropped += 1;
            }
        }

        info!(
            projects = report.projects,
            indexed = report.files_indexed,
            removed = report.files_removed,
            orphans = report.orphans_dropped,
            "Reconciled index with project directories"
        );
        Ok(report)
    }
}

fn recent_history(messages: &[Turn], limit: usize) -> Vec<Turn> {
    // The last message is the turn being handled.
    let prior = &messages[..messages.len().saturating_sub(1)];
    let start = prior.len().saturating_sub(limit);
    prior[start..].to_vec()
}

fn render_hits(hits: &[SearchHit]) -> String {
    let lines: Vec<String> = hits.iter().map(SearchHit::render).collect();
    format!("Asset references found on the web:\n{}", lines.join("\n"))
}

fn failure_text(err: &ChatError) -> String {
    format!("Sorry, I couldn't complete that request ({} error): {}", err.category(), err)
}
