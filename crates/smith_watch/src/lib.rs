//! # smith_watch
//!
//! Watches generated project directories and re-indexes files that are
//! edited outside the conversation.
//!
//! Bursts of events for one file are debounced into a single job. Jobs are
//! executed under the same per-path lock the agent uses for its own writes,
//! so a re-index never interleaves with a chat-driven rewrite of that file.

pub mod debounce;
pub mod error;
pub mod reindex;
pub mod watcher;

pub use debounce::{ChangeKind, Debouncer, ReindexJob};
pub use error::{WatchError, WatchResult};
pub use reindex::{JobOutcome, Reindexer, WatchStats};
pub use watcher::{ProjectWatcher, WatcherConfig};
