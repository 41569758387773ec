//! # smith_index
//!
//! Embedding index over the files of generated site projects.
//!
//! Files are split into chunks, embedded, and stored as fragments keyed by
//! `(project, file)`. Queries return the most similar fragments, optionally
//! scoped to one project.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use smith_index::{HashEmbedder, VectorIndex};
//!
//! let index = VectorIndex::open(".smith/index/fragments.json", Arc::new(HashEmbedder::default()))?;
//! index.sync_tree("site-demo", &root).await?;
//! let hits = index.query("make the header sticky", 5, Some("site-demo")).await?;
//! ```

pub mod atomic;
pub mod chunker;
pub mod embedder;
pub mod error;
pub mod fragment;
pub mod locks;
pub mod store;

pub use atomic::{write_atomic, FileLock, FileStamp};
pub use chunker::{chunk_text, is_indexable, normalize_rel_path, DEFAULT_CHUNK_CHARS, INDEXED_EXTENSIONS};
pub use embedder::{cosine_similarity, Embedder, HashEmbedder, OllamaEmbedder};
pub use error::{IndexError, IndexResult};
pub use fragment::{IndexOutcome, IndexedFragment, ScoredFragment, SyncReport};
pub use locks::{PathGuard, PathLocks, ProjectGuard};
pub use store::VectorIndex;
