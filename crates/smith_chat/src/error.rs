//! Error types for the chat agent.

use thiserror::Error;

/// Result type for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;

/// Chat agent errors.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Bad input, rejected before any side effect
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Generation provider failure, timeout or unusable output
    #[error("Model error: {0}")]
    Model(String),

    /// No generation provider could be configured
    #[error("LLM not configured. Set OPENAI_API_KEY, ANTHROPIC_API_KEY or GOOGLE_API_KEY")]
    LlmNotConfigured,

    /// Context retrieval failure (index query, search, page fetch)
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// State store or index write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Another message for the session is still being processed
    #[error("Session is busy: {0}")]
    SessionBusy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Index error: {0}")]
    Index(#[from] smith_index::IndexError),

    #[error("Watcher error: {0}")]
    Watch(#[from] smith_watch::WatchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Short category name used in failure replies and audit records.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Model(_) | Self::LlmNotConfigured => "model",
            Self::Retrieval(_) => "retrieval",
            Self::Persistence(_) | Self::Index(_) => "persistence",
            Self::SessionBusy(_) => "busy",
            Self::NotFound(_) => "not found",
            Self::Config(_) => "configuration",
            Self::Serialization(_) => "serialization",
            Self::Watch(_) => "watcher",
            Self::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ChatError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}
