//! OpenAI-compatible chat completions client
//!
//! Works against any endpoint speaking the `/chat/completions` protocol:
//! Groq (default), OpenAI, OpenRouter, local servers.

use async_trait::async_trait;
use serde_json::json;

use super::TextCompletion;
use crate::error::{Result, ReverieError};
use crate::types::{CompletionConfig, DEFAULT_COMPLETION_BASE_URL};

/// Chat completions client sending each prompt as a single user message
pub struct OpenAICompletion {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    top_p: f32,
}

impl OpenAICompletion {
    /// Create a client with the default endpoint and sampling settings
    pub fn new(api_key: String) -> Self {
        Self::from_config(api_key, &CompletionConfig::default())
    }

    /// Create a client from configuration
    ///
    /// # Arguments
    /// * `api_key` - API key for authentication
    /// * `config` - endpoint, model and sampling settings; `base_url` falls back to Groq
    pub fn from_config(api_key: String, config: &CompletionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_COMPLETION_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
        }
    }
}

#[async_trait]
impl TextCompletion for OpenAICompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut payload = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
            "top_p": self.top_p,
        });
        if let Some(max_tokens) = self.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ReverieError::Completion(format!(
                "Completion API error {}: {}",
                status, text
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ReverieError::Completion("Completion response has no message content".to_string())
            })?;

        tracing::debug!(model = %self.model, chars = content.len(), "completion received");
        Ok(content.to_string())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
