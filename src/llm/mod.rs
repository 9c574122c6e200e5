//! Text completion port
//!
//! Every pipeline stage talks to the language model through one abstraction:
//! send a prompt, receive text. Backends:
//! - OpenAI-compatible chat completions (Groq, OpenAI, OpenRouter) - requires `openai` feature
//! - Scripted responses for offline runs and tests
//!
//! Completion text carries no schema guarantee; callers decode it with
//! [`decode::LenientDecoder`].

pub mod decode;
#[cfg(feature = "openai")]
mod openai;
mod scripted;

#[cfg(feature = "openai")]
pub use openai::OpenAICompletion;
pub use scripted::{ScriptedCompletion, ScriptedReply};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, ReverieError};
use crate::types::CompletionConfig;

/// Send a textual prompt, receive a textual completion
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Get model name
    fn model_name(&self) -> &str;
}

/// Run one completion under a deadline
pub async fn complete_within(
    completer: &dyn TextCompletion,
    prompt: &str,
    limit: Duration,
) -> Result<String> {
    match tokio::time::timeout(limit, completer.complete(prompt)).await {
        Ok(result) => result,
        Err(_) => Err(ReverieError::Timeout(format!(
            "completion from {} exceeded {}s",
            completer.model_name(),
            limit.as_secs_f32()
        ))),
    }
}

/// Create a completion backend from configuration
///
/// Available providers depend on enabled features:
/// - `"openai"`: any OpenAI-compatible endpoint; requires the `openai` feature and an API key
pub fn create_completer(config: &CompletionConfig) -> Result<Arc<dyn TextCompletion>> {
    match config.provider.as_str() {
        #[cfg(feature = "openai")]
        "openai" | "groq" => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                ReverieError::Config(
                    "REVERIE_LLM_API_KEY required for the openai completion provider".to_string(),
                )
            })?;
            Ok(Arc::new(OpenAICompletion::from_config(api_key, config)))
        }
        #[cfg(not(feature = "openai"))]
        "openai" | "groq" => Err(ReverieError::Config(
            "OpenAI-compatible completions require the 'openai' feature. Build with: cargo build --features openai".to_string(),
        )),
        _ => Err(ReverieError::Config(format!(
            "Unknown completion provider: '{}'. Use 'openai'",
            config.provider
        ))),
    }
}
