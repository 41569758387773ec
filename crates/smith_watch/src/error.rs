//! Error types for the file watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for watcher operations.
pub type WatchResult<T> = Result<T, WatchError>;

/// Errors that can occur while watching project directories.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Failed to read {path} after {attempts} attempts: {source}")]
    Read {
        path: PathBuf,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("Index error: {0}")]
    Index(#[from] smith_index::IndexError),

    #[error("Project root not found: {0}")]
    RootNotFound(PathBuf),

    #[error("Watcher has been shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
