//! Completion client used for episode summarization.
//!
//! The memory subsystem only needs bounded single-shot completions, so the
//! trait is deliberately narrow; the full conversational loop lives with the
//! orchestration layer.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{AiError, Result};

/// Single-shot completion client.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Run one bounded completion and return the assistant text.
    async fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String>;

    /// Get model name.
    fn model_name(&self) -> &str;
}

/// OpenAI chat-completions client.
pub struct OpenAICompletion {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout_secs: u64,
}

impl OpenAICompletion {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout_secs: 60,
        }
    }

    /// Set the model to use
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set custom base URL (for API-compatible services)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl CompletionClient for OpenAICompletion {
    async fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(self.timeout_secs))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(AiError::Completion(format!(
                "OpenAI API error {}: {}",
                status, error_text
            )));
        }

        let data: ChatResponse = response.json().await?;
        data.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AiError::Completion("No completion returned".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Deterministic mock completion client for tests.
pub struct MockCompletion {
    reply: String,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockCompletion {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Toggle failure to simulate an outage.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of completion calls made.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for MockCompletion {
    async fn complete(&self, _system: &str, _prompt: &str, _max_tokens: u32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AiError::Completion("mock completion offline".to_string()));
        }
        Ok(self.reply.clone())
    }

    fn model_name(&self) -> &str {
        "mock-completion"
    }
}
