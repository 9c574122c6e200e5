//! Scripted completion backend
//!
//! Replays a fixed queue of replies in order and records every prompt it
//! was given. Useful for dry runs and for exercising the pipeline without
//! network access.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::TextCompletion;
use crate::error::{Result, ReverieError};

/// One queued reply
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this completion text
    Text(String),
    /// Fail the call with a completion error
    Fail(String),
    /// Sleep, then fail; pairs with call timeouts
    Stall(Duration),
}

/// Completion backend that replays queued replies
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<ScriptedReply>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue plain text replies
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(|t| ScriptedReply::Text(t.into())))
    }

    /// Prompts received so far, in call order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl TextCompletion for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().push(prompt.to_string());
        let reply = self.replies.lock().pop_front();

        match reply {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Fail(message)) => Err(ReverieError::Completion(message)),
            Some(ScriptedReply::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Err(ReverieError::Completion("stalled reply".to_string()))
            }
            None => Err(ReverieError::Completion(
                "scripted completion has no replies left".to_string(),
            )),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
