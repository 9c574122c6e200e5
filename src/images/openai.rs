//! OpenAI images API client (DALL-E)

use async_trait::async_trait;
use serde_json::json;

use super::ImageGenerator;
use crate::error::{Result, ReverieError};
use crate::types::ImageConfig;

const DEFAULT_IMAGE_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIImageGenerator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    size: String,
}

impl OpenAIImageGenerator {
    pub fn from_config(api_key: String, config: &ImageConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_IMAGE_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            size: config.size.clone(),
        }
    }
}

#[async_trait]
impl ImageGenerator for OpenAIImageGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/images/generations", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "n": 1,
                "size": self.size,
                "quality": "standard",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ReverieError::Completion(format!(
                "Image API error {}: {}",
                status, text
            )));
        }

        let data: serde_json::Value = response.json().await?;
        data["data"][0]["url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ReverieError::Completion("Image response has no URL".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
