//! Text embedding backends.
//!
//! Two backends are provided:
//! - [`HashEmbedder`]: deterministic feature hashing, no model server needed
//! - [`OllamaEmbedder`]: calls a local Ollama instance (`/api/embed`)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{IndexError, IndexResult};

/// Produces embedding vectors for text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier of the model and its dimensions.
    ///
    /// Vectors produced under different keys are not comparable.
    fn model_key(&self) -> String;

    /// Embed a batch of texts, one vector per input in order.
    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> IndexResult<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Embedding("No embedding returned".to_string()))
    }
}

/// Local embedder based on hashed token, bigram and trigram features.
pub struct HashEmbedder {
    dim: usize,
    synonyms: HashMap<String, Vec<String>>,
}

impl HashEmbedder {
    pub const DEFAULT_DIM: usize = 256;

    pub fn new(dim: usize) -> Self {
        let groups: &[&[&str]] = &[
            &["background", "bg", "backdrop"],
            &["color", "colour", "palette", "theme"],
            &["dark", "night", "black"],
            &["header", "navbar", "nav", "navigation", "menu"],
            &["footer", "bottom"],
            &["button", "btn", "cta"],
            &["image", "img", "photo", "picture", "logo"],
            &["font", "typography", "text"],
        ];
        let mut synonyms: HashMap<String, Vec<String>> = HashMap::new();
        for group in groups {
            for token in *group {
                let others = group
                    .iter()
                    .filter(|other| *other != token)
                    .map(|other| other.to_string())
                    .collect();
                synonyms.insert(token.to_string(), others);
            }
        }

        Self {
            dim: dim.max(64),
            synonyms,
        }
    }

    /// Embed text synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dim];
        let normalized = text.to_lowercase();
        let tokens = word_tokens(&normalized);
        if tokens.is_empty() {
            return vec;
        }

        for token in &tokens {
            self.add_feature(&mut vec, &format!("t:{}", token), 1.0);
            if let Some(expanded) = self.synonyms.get(token) {
                for syn in expanded {
                    self.add_feature(&mut vec, &format!("t:{}", syn), 0.35);
                }
            }
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vec, &format!("b:{}_{}", pair[0], pair[1]), 0.8);
        }

        let compact: Vec<char> = normalized.chars().filter(|c| !c.is_whitespace()).collect();
        for tri in compact.windows(3) {
            let trigram: String = tri.iter().collect();
            self.add_feature(&mut vec, &format!("c:{}", trigram), 0.15);
        }

        let norm = vec.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v = (*v as f64 / norm) as f32;
            }
        }
        vec
    }

    fn add_feature(&self, vec: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        let idx = (u64::from_le_bytes(first) % self.dim as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vec[idx] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIM)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_key(&self) -> String {
        format!("hash-v1:{}", self.dim)
    }

    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

fn word_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Embedder backed by an Ollama server.
pub struct OllamaEmbedder {
    host: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub const DEFAULT_MODEL: &'static str = "nomic-embed-text";
    pub const DEFAULT_HOST: &'static str = "http://127.0.0.1:11434";

    pub fn new(host: Option<String>, model: Option<String>) -> IndexResult<Self> {
        let host = host
            .or_else(|| std::env::var("OLLAMA_HOST").ok())
            .unwrap_or_else(|| Self::DEFAULT_HOST.to_string())
            .trim_end_matches('/')
            .to_string();
        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| IndexError::Embedding(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { host, model, client })
    }
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_key(&self) -> String {
        format!("ollama:{}", self.model)
    }

    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/api/embed", self.host);
        let response = self
            .client
            .post(&url)
            .json(&OllamaEmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| {
                IndexError::Embedding(format!(
                    "Ollama request failed: {}. Ensure Ollama is running and model '{}' is available",
                    e, self.model
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Embedding(format!(
                "Ollama embedding request failed (HTTP {}): {}",
                status, body
            )));
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| IndexError::Embedding(format!("Failed to parse Ollama response: {}", e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(IndexError::Embedding(format!(
                "Ollama returned {} vectors for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        Ok(parsed.embeddings)
    }
}

/// Cosine similarity between two vectors; 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let magnitude = (norm_a * norm_b).sqrt();
    if magnitude == 0.0 {
        0.0
    } else {
        dot / magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed_one("body { background: #111; }").await.unwrap();
        let b = embedder.embed_one("body { background: #111; }").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), HashEmbedder::DEFAULT_DIM);
    }

    #[test]
    fn test_related_text_scores_higher() {
        let embedder = HashEmbedder::default();
        let query = embedder.embed_text("make the background dark");
        let css = embedder.embed_text("body { background: white; color: black; }");
        let js = embedder.embed_text("document.querySelector('form').addEventListener('submit', send);");
        assert!(cosine_similarity(&query, &css) > cosine_similarity(&query, &js));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashEmbedder::new(64);
        assert!(embedder.embed_text("   ").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_model_key_includes_dimensions() {
        assert_eq!(HashEmbedder::new(128).model_key(), "hash-v1:128");
        assert_eq!(HashEmbedder::new(8).model_key(), "hash-v1:64");
    }
}
