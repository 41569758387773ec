//! Error types for the index module.

use thiserror::Error;

/// Result type alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors that can occur while embedding, storing or querying fragments.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Index persistence failed: {0}")]
    Persist(String),

    #[error("Failed to lock index {path}: {message}")]
    Lock { path: String, message: String },

    #[error("Corrupt index file {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
