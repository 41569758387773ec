//! Core types for the site agent.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a chat session
pub type SessionId = String;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One message of a conversation. Turns are append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    /// Unique turn ID (UUID)
    pub id: String,
    /// Position within the session, starting at 0
    pub ordinal: usize,
    pub role: MessageRole,
    pub content: String,
    /// Files written or modified by this turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Create a new user turn
    pub fn user(ordinal: usize, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ordinal,
            role: MessageRole::User,
            content: content.into(),
            files: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Create a new assistant turn
    pub fn assistant(ordinal: usize, content: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ordinal,
            role: MessageRole::Assistant,
            content: content.into(),
            files,
            created_at: Utc::now(),
        }
    }
}

/// What a message asks for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// Create a site from scratch
    Build,
    /// Modify the existing site
    Edit,
    /// Rework the existing site after an external page
    Clone,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::Build => write!(f, "build"),
            Intent::Edit => write!(f, "edit"),
            Intent::Clone => write!(f, "clone"),
        }
    }
}

/// Workflow stage, persisted on every transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStage {
    #[default]
    Idle,
    Classifying,
    Retrieving,
    Generating,
    Writing,
    Responding,
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkflowStage::Idle => "idle",
            WorkflowStage::Classifying => "classifying",
            WorkflowStage::Retrieving => "retrieving",
            WorkflowStage::Generating => "generating",
            WorkflowStage::Writing => "writing",
            WorkflowStage::Responding => "responding",
        };
        write!(f, "{}", name)
    }
}

/// Identity of a session and its project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "projectDir")]
    pub project_dir: PathBuf,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Record of the most recent failed turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    /// Turn ordinal of the user message that failed
    pub ordinal: usize,
    /// Stage the turn was in when it failed
    pub stage: WorkflowStage,
    /// Error category (model, persistence, ...)
    pub category: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Serialized workflow state of one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub session: SessionInfo,
    pub stage: WorkflowStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(rename = "wantsAssets", default)]
    pub wants_assets: bool,
    #[serde(rename = "referenceUrl", default, skip_serializing_if = "Option::is_none")]
    pub reference_url: Option<String>,
    /// Context gathered for the in-flight turn
    #[serde(rename = "pendingContext", default, skip_serializing_if = "Vec::is_empty")]
    pub pending_context: Vec<String>,
    #[serde(default)]
    pub messages: Vec<Turn>,
    #[serde(rename = "lastFailure", default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureRecord>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Fresh idle checkpoint for a new session.
    pub fn new(session: SessionInfo) -> Self {
        Self {
            updated_at: session.created_at,
            session,
            stage: WorkflowStage::Idle,
            intent: None,
            wants_assets: false,
            reference_url: None,
            pending_context: Vec::new(),
            messages: Vec::new(),
            last_failure: None,
        }
    }

    /// Ordinal the next turn will get.
    pub fn next_ordinal(&self) -> usize {
        self.messages.len()
    }

    /// Clear per-turn fields, returning to idle.
    pub fn reset_turn(&mut self) {
        self.stage = WorkflowStage::Idle;
        self.intent = None;
        self.wants_assets = false;
        self.reference_url = None;
        self.pending_context.clear();
    }
}

/// Outcome of one turn, as recorded in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnOutcome {
    Completed,
    Failed,
    /// Interrupted by a process exit and recovered on the next load
    Interrupted,
}

/// Line of a session's append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub ordinal: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    pub outcome: TurnOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Reply to a chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatReply {
    #[serde(rename = "replyText")]
    pub reply_text: String,
    #[serde(rename = "projectId", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(rename = "projectPath", skip_serializing_if = "Option::is_none")]
    pub project_path: Option<PathBuf>,
    /// Files written by this turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    /// Set when the turn failed; holds the error category
    #[serde(rename = "failure", default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ChatReply {
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Current state of a session for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: SessionId,
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "projectPath")]
    pub project_path: PathBuf,
    #[serde(rename = "projectExists")]
    pub project_exists: bool,
    pub stage: WorkflowStage,
    pub turns: usize,
    #[serde(rename = "indexedFiles")]
    pub indexed_files: Vec<String>,
    #[serde(rename = "lastFailure", skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureRecord>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Summary of a session for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub stage: WorkflowStage,
    pub turns: usize,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// A file of a project, for enumeration and packaging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectFileEntry {
    /// Path relative to the project root, `/`-separated
    pub path: String,
    pub size: u64,
}

/// Summary of a startup reconciliation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub projects: usize,
    #[serde(rename = "filesIndexed")]
    pub files_indexed: usize,
    #[serde(rename = "filesRemoved")]
    pub files_removed: usize,
    #[serde(rename = "orphansDropped")]
    pub orphans_dropped: usize,
    pub watched: usize,
}
