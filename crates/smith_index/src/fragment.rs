//! Indexed fragment types.

use serde::{Deserialize, Serialize};

/// One embedded chunk of a project file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedFragment {
    /// Owning project (directory name under the output root)
    #[serde(rename = "projectId")]
    pub project_id: String,
    /// File path relative to the project root, `/`-separated
    #[serde(rename = "filePath")]
    pub file_path: String,
    /// Position of this chunk within the file
    #[serde(rename = "chunkIndex")]
    pub chunk_index: usize,
    /// Chunk text
    pub text: String,
    /// Embedding vector
    pub embedding: Vec<f32>,
    /// Insertion sequence number; higher is more recent
    pub seq: u64,
}

/// A fragment returned by a query along with its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredFragment {
    pub fragment: IndexedFragment,
    pub score: f32,
}

impl ScoredFragment {
    /// Render the fragment for inclusion in a prompt.
    pub fn render(&self) -> String {
        format!(
            "// {}/{} (chunk {})\n{}",
            self.fragment.project_id, self.fragment.file_path, self.fragment.chunk_index, self.fragment.text
        )
    }
}

/// Result of indexing a single file from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// File was read and its fragments replaced
    Indexed { chunks: usize },
    /// File no longer exists; its fragments were removed
    Removed,
    /// File type is not indexed
    Skipped,
}

/// Summary of a tree synchronisation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub indexed: usize,
    pub removed: usize,
}
