//! # smith_chat - Conversational site generation
//!
//! Turns chat messages into static websites and keeps refining them:
//!
//! - **Build / edit / clone**: a message creates a site, changes it, or
//!   reworks it after an external reference page
//! - **Retrieval**: similar fragments of the current (or any previous)
//!   project are fed to the model as context
//! - **Checkpoints**: each session's workflow state is saved at every stage
//!   transition and recovered after a crash
//! - **Optional web augmentation**: asset search and reference page outlines
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │  SiteAgent  │────▶│ StateStore   │     │ GenerationClient │
//! └──────┬──────┘     └──────────────┘     └──────────────────┘
//!        │
//!        ├──────────▶ ProjectStore ──▶ <output_dir>/<project>/
//!        │
//!        └──────────▶ VectorIndex ◀── ProjectWatcher (manual edits)
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod mock;
pub mod project;
pub mod prompt;
pub mod search;
pub mod state;
pub mod types;
pub mod workflow;

pub use config::*;
pub use error::*;
pub use llm::*;
pub use mock::{MockGenerator, MockResponse};
pub use project::*;
pub use prompt::{parse_generation_output, render_prompt, CONVENTIONAL_FILES, SYSTEM_INSTRUCTION};
pub use search::{outline_html, GeminiSearch, HttpFetcher, PageFetcher, PageOutline, SearchHit, WebSearch};
pub use state::*;
pub use types::*;
pub use workflow::*;
