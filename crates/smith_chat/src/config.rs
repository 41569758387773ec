//! Configuration loaded from `smith.yaml` with environment overrides.
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration. Credentials are never read from the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smith_index::{Embedder, HashEmbedder, OllamaEmbedder};
use smith_watch::WatcherConfig;

use crate::error::{ChatError, ChatResult};
use crate::llm::LlmProvider;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "smith.yaml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SmithConfig {
    pub paths: PathsConfig,
    pub agent: AgentConfig,
    pub watcher: WatcherSettings,
    pub llm: LlmConfig,
    pub embeddings: EmbeddingsConfig,
    pub search: SearchConfig,
}

/// Where projects and state live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Root directory holding one directory per project
    pub output_dir: PathBuf,
    /// Root directory for sessions and the index
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("generated_apps"),
            data_dir: PathBuf::from(".smith"),
        }
    }
}

impl PathsConfig {
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("index").join("fragments.json")
    }
}

/// Agent workflow tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Fragments retrieved per turn
    pub top_k: usize,
    /// Upper bound on one generation call
    pub generation_timeout_secs: u64,
    /// Recent turns included in the prompt
    pub history_turns: usize,
    /// Queue a second message for a busy session instead of rejecting it
    pub queue_messages: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            generation_timeout_secs: 120,
            history_turns: 6,
            queue_messages: true,
        }
    }
}

impl AgentConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs.max(1))
    }
}

/// File watcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatcherSettings {
    pub enabled: bool,
    pub debounce_ms: u64,
    pub read_retries: u32,
    pub retry_delay_ms: u64,
    pub workers: usize,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 300,
            read_retries: 2,
            retry_delay_ms: 150,
            workers: 4,
        }
    }
}

impl WatcherSettings {
    pub fn to_watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            read_retries: self.read_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            workers: self.workers.max(1),
            ..WatcherConfig::default()
        }
    }
}

/// Generation provider selection. Keys come from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: Option<LlmProvider>,
    pub model: Option<String>,
}

/// Embedding backend kind.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Hash,
    Ollama,
}

/// Embedding backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub backend: EmbeddingBackend,
    pub model: Option<String>,
    pub url: Option<String>,
    /// Vector size for the hash backend
    pub dimensions: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Hash,
            model: None,
            url: None,
            dimensions: HashEmbedder::DEFAULT_DIM,
        }
    }
}

impl EmbeddingsConfig {
    /// Build the configured embedder.
    pub fn build_embedder(&self) -> ChatResult<Arc<dyn Embedder>> {
        match self.backend {
            EmbeddingBackend::Hash => Ok(Arc::new(HashEmbedder::new(self.dimensions))),
            EmbeddingBackend::Ollama => {
                let embedder = OllamaEmbedder::new(self.url.clone(), self.model.clone())?;
                Ok(Arc::new(embedder))
            }
        }
    }
}

/// Web search settings. Search also needs `GOOGLE_API_KEY`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    pub enabled: bool,
    pub model: Option<String>,
    /// Fetch external pages referenced by clone requests
    pub fetch_pages: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: None,
            fetch_pages: true,
        }
    }
}

impl SmithConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `smith.yaml` in the working
    /// directory is used when present, defaults otherwise. Environment
    /// overrides are applied last.
    pub fn load(path: Option<&Path>) -> ChatResult<Self> {
        let mut config = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ChatError::Config(format!("Config file not found: {}", path.display())));
                }
                Self::from_file(path)?
            }
            None => {
                let default_path = Path::new(CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> ChatResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> ChatResult<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(ChatError::from)
    }

    /// Serialize the configuration to YAML.
    pub fn to_yaml(&self) -> ChatResult<String> {
        serde_yaml::to_string(self).map_err(ChatError::from)
    }

    /// Apply `SMITH_*` and `OLLAMA_HOST` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = non_empty("SMITH_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty("SMITH_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(dir);
        }
        if let Some(model) = non_empty("SMITH_LLM_MODEL") {
            self.llm.model = Some(model);
        }
        if let Some(host) = non_empty("OLLAMA_HOST") {
            self.embeddings.url = Some(host);
        }
    }
}
