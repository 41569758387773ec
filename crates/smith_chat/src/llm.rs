//! Generation client boundary and the HTTP LLM adapter behind it.
//!
//! Supports OpenAI, Anthropic and Gemini, selected from configuration or
//! from whichever API key is present in the environment.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{ChatError, ChatResult};
use crate::prompt::{parse_generation_output, render_prompt, SYSTEM_INSTRUCTION};
use crate::types::{Intent, Turn};

/// Everything the model needs to produce files for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub intent: Intent,
    /// The user's message
    pub instruction: String,
    /// Retrieved context blocks, in prompt order
    pub context: Vec<String>,
    /// Recent conversation turns
    pub history: Vec<Turn>,
    /// Current content of the project's files, by relative path
    pub prior_files: BTreeMap<String, String>,
}

/// Files produced by the model plus a note for the user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutput {
    pub files: BTreeMap<String, String>,
    pub explanation: String,
}

/// Produces project files from a generation request.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Fails with [`ChatError::Model`] on provider failure or unusable output.
    async fn generate(&self, request: &GenerationRequest) -> ChatResult<GenerationOutput>;
}

/// LLM provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAI,
    Anthropic,
    Gemini,
}

impl LlmProvider {
    /// Environment variable holding the provider's key.
    pub fn key_var(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "OPENAI_API_KEY",
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::Gemini => "GOOGLE_API_KEY",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "gpt-5-mini",
            LlmProvider::Anthropic => "claude-sonnet-4.5",
            LlmProvider::Gemini => "gemini-2.0-flash",
        }
    }
}

/// LLM adapter that handles API calls
pub struct LlmAdapter {
    provider: LlmProvider,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

/// Response from LLM including usage info
pub struct LlmResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
}

const MAX_RETRIES: u32 = 3;
const MAX_OUTPUT_TOKENS: u32 = 8192;

impl LlmAdapter {
    /// Create a new LLM adapter with explicit configuration
    pub fn new(provider: LlmProvider, api_key: String, model: Option<String>) -> Self {
        Self {
            provider,
            api_key,
            model: model.unwrap_or_else(|| provider.default_model().to_string()),
            client: reqwest::Client::new(),
        }
    }

    /// Create an LLM adapter from environment variables
    ///
    /// Checks in order:
    /// 1. OPENAI_API_KEY
    /// 2. ANTHROPIC_API_KEY
    /// 3. GOOGLE_API_KEY
    pub fn from_env() -> ChatResult<Self> {
        let config = LlmConfig {
            provider: None,
            model: std::env::var("SMITH_LLM_MODEL").ok(),
        };
        Self::from_config_with(&config, |key| std::env::var(key).ok())
    }

    /// Create an LLM adapter from configuration, reading keys from the environment.
    pub fn from_config(config: &LlmConfig) -> ChatResult<Self> {
        Self::from_config_with(config, |key| std::env::var(key).ok())
    }

    /// Create an LLM adapter from configuration, reading keys through `lookup`.
    ///
    /// An explicit provider requires its own key. Otherwise the first
    /// provider with a key wins.
    pub fn from_config_with<F>(config: &LlmConfig, lookup: F) -> ChatResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key_for = |provider: LlmProvider| lookup(provider.key_var()).filter(|k| !k.trim().is_empty());
        let model = config.model.clone().filter(|m| !m.trim().is_empty());

        if let Some(provider) = config.provider {
            let api_key = key_for(provider).ok_or(ChatError::LlmNotConfigured)?;
            return Ok(Self::new(provider, api_key, model));
        }

        for provider in [LlmProvider::OpenAI, LlmProvider::Anthropic, LlmProvider::Gemini] {
            if let Some(api_key) = key_for(provider) {
                return Ok(Self::new(provider, api_key, model));
            }
        }

        Err(ChatError::LlmNotConfigured)
    }

    /// Get the current provider
    pub fn provider(&self) -> &LlmProvider {
        &self.provider
    }

    /// Get the current model
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Complete a single prompt under a system instruction
    pub async fn complete(&self, system: &str, prompt: &str) -> ChatResult<LlmResponse> {
        match self.provider {
            LlmProvider::OpenAI => self.complete_openai(system, prompt).await,
            LlmProvider::Anthropic => self.complete_anthropic(system, prompt).await,
            LlmProvider::Gemini => self.complete_gemini(system, prompt).await,
        }
    }

    /// Send a request, retrying network errors, 5xx and 429 with exponential backoff.
    async fn send_with_retry<F>(&self, label: &str, build: F) -> ChatResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // 2s, 4s
                let delay = std::time::Duration::from_secs(1 << attempt);
                tokio::time::sleep(delay).await;
            }

            let response = match build().send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(provider = label, attempt = attempt + 1, error = %e, "LLM request failed");
                    last_error = Some(ChatError::Model(format!("Network error: {}", e)));
                    continue;
                }
            };

            let status = response.status();

            if status.is_server_error() || status.as_u16() == 429 {
                let body = response.text().await.unwrap_or_default();
                warn!(provider = label, attempt = attempt + 1, %status, "Transient LLM API error");
                last_error = Some(ChatError::Model(format!(
                    "{} API error {} (attempt {}/{}): {}",
                    label,
                    status,
                    attempt + 1,
                    MAX_RETRIES,
                    body
                )));
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ChatError::Model(format!("{} API error {}: {}", label, status, body)));
            }

            return Ok(response);
        }

        Err(last_error.unwrap_or_else(|| ChatError::Model("Max retries exceeded".to_string())))
    }

    // OpenAI chat completion
    async fn complete_openai(&self, system: &str, prompt: &str) -> ChatResult<LlmResponse> {
        let url = "https://api.openai.com/v1/chat/completions";

        let request = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_completion_tokens: Some(MAX_OUTPUT_TOKENS),
        };

        let response = self
            .send_with_retry("OpenAI", || {
                self.client
                    .post(url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .header("Content-Type", "application/json")
                    .json(&request)
            })
            .await?;

        let result: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Model(format!("Failed to parse response: {}", e)))?;

        let content = result
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| ChatError::Model("No response from OpenAI".to_string()))?;

        let (input_tokens, output_tokens) = result
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        Ok(LlmResponse {
            content,
            input_tokens,
            output_tokens,
            model: self.model.clone(),
        })
    }

    // Anthropic messages API
    async fn complete_anthropic(&self, system: &str, prompt: &str) -> ChatResult<LlmResponse> {
        let url = "https://api.anthropic.com/v1/messages";

        let request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: MAX_OUTPUT_TOKENS,
            system: Some(system.to_string()),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .send_with_retry("Anthropic", || {
                self.client
                    .post(url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .header("Content-Type", "application/json")
                    .json(&request)
            })
            .await?;

        let result: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Model(format!("Failed to parse response: {}", e)))?;

        let content = result
            .content
            .first()
            .map(|c| c.text.clone())
            .ok_or_else(|| ChatError::Model("No response from Anthropic".to_string()))?;

        let (input_tokens, output_tokens) = result
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((0, 0));

        Ok(LlmResponse {
            content,
            input_tokens,
            output_tokens,
            model: self.model.clone(),
        })
    }

    // Gemini generateContent
    async fn complete_gemini(&self, system: &str, prompt: &str) -> ChatResult<LlmResponse> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );

        let request = GeminiRequest {
            system_instruction: Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: system.to_string(),
                }],
            }),
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: MAX_OUTPUT_TOKENS,
                response_mime_type: "application/json".to_string(),
            },
        };

        let response = self
            .send_with_retry("Gemini", || {
                self.client
                    .post(&url)
                    .header("x-goog-api-key", &self.api_key)
                    .header("Content-Type", "application/json")
                    .json(&request)
            })
            .await?;

        let result: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Model(format!("Failed to parse response: {}", e)))?;

        let content = result
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().filter_map(|p| p.text.as_deref()).collect::<Vec<_>>().join(""))
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| ChatError::Model("No response from Gemini".to_string()))?;

        let (input_tokens, output_tokens) = result
            .usage_metadata
            .map(|u| (u.prompt_token_count, u.candidates_token_count))
            .unwrap_or((0, 0));

        Ok(LlmResponse {
            content,
            input_tokens,
            output_tokens,
            model: self.model.clone(),
        })
    }
}

#[async_trait]
impl GenerationClient for LlmAdapter {
    async fn generate(&self, request: &GenerationRequest) -> ChatResult<GenerationOutput> {
        let prompt = render_prompt(request);
        let response = self.complete(SYSTEM_INSTRUCTION, &prompt).await?;
        debug!(
            model = %response.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Generation completed"
        );
        parse_generation_output(&response.content)
    }
}

// OpenAI API types
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: String,
}

// Anthropic API types
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: String,
}

// Gemini API types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_provider_detection() {
        let config = LlmConfig::default();

        assert!(matches!(
            LlmAdapter::from_config_with(&config, lookup(&[])),
            Err(ChatError::LlmNotConfigured)
        ));

        let adapter = LlmAdapter::from_config_with(&config, lookup(&[("OPENAI_API_KEY", "k")])).unwrap();
        assert_eq!(adapter.provider(), &LlmProvider::OpenAI);

        let adapter = LlmAdapter::from_config_with(&config, lookup(&[("ANTHROPIC_API_KEY", "k")])).unwrap();
        assert_eq!(adapter.provider(), &LlmProvider::Anthropic);

        let adapter = LlmAdapter::from_config_with(&config, lookup(&[("GOOGLE_API_KEY", "k")])).unwrap();
        assert_eq!(adapter.provider(), &LlmProvider::Gemini);

        // Empty keys do not count.
        let adapter = LlmAdapter::from_config_with(
            &config,
            lookup(&[("OPENAI_API_KEY", ""), ("GOOGLE_API_KEY", "k")]),
        )
        .unwrap();
        assert_eq!(adapter.provider(), &LlmProvider::Gemini);
    }

    #[test]
    fn test_explicit_provider_requires_its_key() {
        let config = LlmConfig {
            provider: Some(LlmProvider::Gemini),
            model: None,
        };
        let result = LlmAdapter::from_config_with(&config, lookup(&[("OPENAI_API_KEY", "k")]));
        assert!(matches!(result, Err(ChatError::LlmNotConfigured)));
    }

    #[test]
    fn test_default_models() {
        let openai = LlmAdapter::new(LlmProvider::OpenAI, "key".to_string(), None);
        assert_eq!(openai.model(), "gpt-5-mini");

        let anthropic = LlmAdapter::new(LlmProvider::Anthropic, "key".to_string(), None);
        assert_eq!(anthropic.model(), "claude-sonnet-4.5");

        let gemini = LlmAdapter::new(LlmProvider::Gemini, "key".to_string(), None);
        assert_eq!(gemini.model(), "gemini-2.0-flash");
    }

    #[test]
    fn test_custom_model() {
        let config = LlmConfig {
            provider: None,
            model: Some("gpt-4o".to_string()),
        };
        let adapter = LlmAdapter::from_config_with(&config, lookup(&[("OPENAI_API_KEY", "k")])).unwrap();
        assert_eq!(adapter.model(), "gpt-4o");
    }

    #[test]
    fn test_gemini_request_shape() {
        let request = GeminiRequest {
            system_instruction: Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: "sys".into() }],
            }),
            contents: vec![],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: 10,
                response_mime_type: "application/json".into(),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 10);
        assert!(value["systemInstruction"].get("role").is_none());
    }
}
