//! CLI command definitions.
//!
//! Each subcommand maps to one operation of the site agent or its index.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};

use smith_chat::{
    ChatError, ChatResult, GeminiSearch, GenerationClient, GenerationOutput, GenerationRequest, HttpFetcher,
    LlmAdapter, SiteAgent, SmithConfig,
};
use smith_watch::ProjectWatcher;

pub mod chat;
pub mod index;
pub mod project;
pub mod session;

/// sitesmith - conversational static site generator
#[derive(Parser)]
#[command(name = "smith")]
#[command(version, about = "sitesmith - build and refine static websites by chatting")]
#[command(long_about = r#"
sitesmith turns chat messages into static websites (index.html, styles.css,
app.js) and keeps refining them. Edits made by hand are picked up by a file
watcher and fed back into the retrieval index.

COMMANDS:
  chat      → Send one message to a session
  repl      → Interactive session with background file watching
  clear     → Discard a session and its project
  history   → Show the turns of a session
  sessions  → List sessions
  show      → Print one project file
  files     → List the files of a project
  reindex   → Re-synchronise the index with the project directories
  watch     → Watch all projects until Ctrl-C

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Validation failure
  4 - Model error

Credentials are read from OPENAI_API_KEY, ANTHROPIC_API_KEY or GOOGLE_API_KEY.
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file (default: ./smith.yaml)
    #[arg(short, long, global = true, env = "SMITH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// JSON logs and JSON command output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn global(&self) -> GlobalArgs {
        GlobalArgs {
            config: self.config.clone(),
            json: self.json,
        }
    }
}

/// Flags shared by every command.
#[derive(Debug, Clone, Default)]
pub struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send one message to a session
    Chat(chat::ChatArgs),

    /// Start an interactive session
    Repl(chat::ReplArgs),

    /// Discard a session, its project and its index entries
    Clear(session::SessionArgs),

    /// Show the conversation of a session
    History(session::SessionArgs),

    /// List sessions, most recent first
    Sessions,

    /// Print a project file to stdout
    Show(project::ShowArgs),

    /// List the files of a project
    Files(project::FilesArgs),

    /// Re-synchronise the index with the project directories
    Reindex,

    /// Watch every project for manual edits until Ctrl-C
    Watch,
}

/// Load the configuration named by the global flags.
pub fn load_config(global: &GlobalArgs) -> Result<SmithConfig> {
    let config = SmithConfig::load(global.config.as_deref()).context("Failed to load configuration")?;
    debug!(
        output_dir = %config.paths.output_dir.display(),
        data_dir = %config.paths.data_dir.display(),
        "Loaded configuration"
    );
    Ok(config)
}

/// Stand-in generator for commands that never generate.
struct NoGenerator;

#[async_trait]
impl GenerationClient for NoGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> ChatResult<GenerationOutput> {
        Err(ChatError::LlmNotConfigured)
    }
}

/// Agent for commands that only read or maintain state.
pub fn offline_agent(config: &SmithConfig) -> Result<SiteAgent> {
    SiteAgent::from_config(config, Arc::new(NoGenerator)).context("Failed to open the site index")
}

/// Agent with a model provider and the optional web collaborators.
pub fn online_agent(config: &SmithConfig) -> Result<SiteAgent> {
    let llm = LlmAdapter::from_config(&config.llm)?;
    info!(provider = ?llm.provider(), model = llm.model(), "Using model provider");

    let mut agent = SiteAgent::from_config(config, Arc::new(llm)).context("Failed to open the site index")?;

    if config.search.enabled {
        if let Some(search) = GeminiSearch::from_env() {
            let search = match &config.search.model {
                Some(model) => search.with_model(model.clone()),
                None => search,
            };
            agent = agent.with_search(Arc::new(search));
            debug!("Web search enabled");
        }
    }
    if config.search.fetch_pages {
        let fetcher = HttpFetcher::new(Duration::from_secs(20))?;
        agent = agent.with_fetcher(Arc::new(fetcher));
    }
    Ok(agent)
}

/// Start a watcher over the agent's index and attach it to the agent.
pub fn attach_watcher(agent: SiteAgent, config: &SmithConfig) -> (SiteAgent, Arc<ProjectWatcher>) {
    let watcher = Arc::new(ProjectWatcher::start(
        agent.index(),
        agent.locks(),
        config.watcher.to_watcher_config(),
    ));
    (agent.with_watcher(Arc::clone(&watcher)), watcher)
}

/// Print `value` as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
