//! Mock generation client for testing.
//!
//! Provides a configurable implementation of [`GenerationClient`] that
//! captures requests and returns predefined outputs, so the workflow can be
//! exercised without a model provider.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{ChatError, ChatResult};
use crate::llm::{GenerationClient, GenerationOutput, GenerationRequest};
use crate::prompt::parse_generation_output;

/// Predefined result of a generation call.
#[derive(Debug, Clone)]
pub struct MockResponse {
    result: Result<GenerationOutput, String>,
    delay: Option<Duration>,
}

impl MockResponse {
    /// Succeed with the given files.
    pub fn files<I, P, C>(files: I, explanation: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        Self {
            result: Ok(GenerationOutput {
                files: files.into_iter().map(|(p, c)| (p.into(), c.into())).collect(),
                explanation: explanation.into(),
            }),
            delay: None,
        }
    }

    /// Parse a raw model reply the way a real provider's reply is parsed.
    ///
    /// Unparseable text becomes a model failure.
    pub fn raw(text: &str) -> Self {
        Self {
            result: parse_generation_output(text).map_err(|e| match e {
                ChatError::Model(message) => message,
                other => other.to_string(),
            }),
            delay: None,
        }
    }

    /// Fail with a model error.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            delay: None,
        }
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Mock generation client.
///
/// Without configured responses every call returns the three conventional
/// files, each mentioning the instruction.
#[derive(Clone, Default)]
pub struct MockGenerator {
    responses: Arc<RwLock<Vec<MockResponse>>>,
    response_index: Arc<AtomicUsize>,
    captured: Arc<RwLock<Vec<GenerationRequest>>>,
    simulate_failure: Arc<RwLock<Option<String>>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a response for the next call.
    pub fn add_response(self, response: MockResponse) -> Self {
        self.responses.write().push(response);
        self
    }

    /// Replace all responses. They are returned in order, then cycle.
    pub fn with_responses(self, responses: Vec<MockResponse>) -> Self {
        *self.responses.write() = responses;
        self
    }

    /// Fail every call until [`MockGenerator::clear_failure`].
    pub fn simulate_failure(self, message: impl Into<String>) -> Self {
        *self.simulate_failure.write() = Some(message.into());
        self
    }

    pub fn clear_failure(&self) {
        *self.simulate_failure.write() = None;
    }

    /// Get all captured requests.
    pub fn get_requests(&self) -> Vec<GenerationRequest> {
        self.captured.read().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.captured.read().len()
    }

    pub fn clear_calls(&self) {
        self.captured.write().clear();
    }

    fn next_response(&self, request: &GenerationRequest) -> MockResponse {
        let responses = self.responses.read();
        if responses.is_empty() {
            return default_response(request);
        }
        let index = self.response_index.fetch_add(1, Ordering::SeqCst);
        responses
            .get(index % responses.len())
            .cloned()
            .unwrap_or_else(|| default_response(request))
    }
}

fn default_response(request: &GenerationRequest) -> MockResponse {
    let instruction = request.instruction.trim();
    let files: BTreeMap<&str, String> = [
        ("index.html", format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<link rel=\"stylesheet\" href=\"styles.css\">\n</head>\n<body>\n<h1>{}</h1>\n<script src=\"app.js\"></script>\n</body>\n</html>\n",
            instruction
        )),
        ("styles.css", format!("/* {} */\nbody {{ font-family: sans-serif; }}\n", instruction)),
        ("app.js", format!("// {}\nconsole.log(\"ready\");\n", instruction)),
    ]
    .into_iter()
    .collect();
    MockResponse::files(files, "")
}

#[async_trait]
impl GenerationClient for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> ChatResult<GenerationOutput> {
        self.captured.write().push(request.clone());

        let failure = self.simulate_failure.read().clone();
        if let Some(message) = failure {
            return Err(ChatError::Model(message));
        }

        let response = self.next_response(request);
        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        response.result.map_err(ChatError::Model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Intent;

    fn request(instruction: &str) -> GenerationRequest {
        GenerationRequest {
            intent: Intent::Build,
            instruction: instruction.to_string(),
            context: Vec::new(),
            history: Vec::new(),
            prior_files: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_default_response_has_conventional_files() {
        let mock = MockGenerator::new();
        let output = mock.generate(&request("A bakery")).await.unwrap();
        assert_eq!(output.files.len(), 3);
        assert!(output.files["index.html"].contains("A bakery"));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_responses_cycle() {
        let mock = MockGenerator::new()
            .add_response(MockResponse::files([("a.css", "a")], "first"))
            .add_response(MockResponse::failure("boom"));

        assert_eq!(mock.generate(&request("x")).await.unwrap().explanation, "first");
        assert!(matches!(mock.generate(&request("x")).await, Err(ChatError::Model(_))));
        assert_eq!(mock.generate(&request("x")).await.unwrap().explanation, "first");
        assert_eq!(mock.get_requests().len(), 3);
    }

    #[tokio::test]
    async fn test_raw_and_simulated_failure() {
        let mock = MockGenerator::new()
            .add_response(MockResponse::raw("not json"))
            .simulate_failure("provider down");

        let err = mock.generate(&request("x")).await.unwrap_err();
        assert!(err.to_string().contains("provider down"));

        mock.clear_failure();
        assert!(matches!(mock.generate(&request("x")).await, Err(ChatError::Model(_))));
    }
}
