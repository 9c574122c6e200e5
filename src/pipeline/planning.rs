//! Planning stage: analysis to memory block plans

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::prompts;
use super::validate::{self, PLAN_KEY};
use crate::error::{Result, ReverieError};
use crate::llm::decode::object_decoder;
use crate::llm::{complete_within, TextCompletion};
use crate::types::{Analysis, MemoryBlockPlan, TranscriptBatch};

/// One completion call, no reconstruction: a bad plan is fatal to the batch
pub struct PlanningStage {
    completer: Arc<dyn TextCompletion>,
    call_timeout: Duration,
}

impl PlanningStage {
    pub fn new(completer: Arc<dyn TextCompletion>, call_timeout: Duration) -> Self {
        Self {
            completer,
            call_timeout,
        }
    }

    pub async fn plan(
        &self,
        analysis: &Analysis,
        batch: &TranscriptBatch,
    ) -> Result<Vec<MemoryBlockPlan>> {
        let prompt = prompts::plan_prompt(analysis, &batch.texts())?;
        let text = complete_within(self.completer.as_ref(), &prompt, self.call_timeout).await?;
        debug!(response = %text, "plan completion");

        let mut value = object_decoder().decode(&text)?;
        if !validate::is_plan(&value) {
            return Err(ReverieError::Validation(format!(
                "plan lacks a non-empty '{}' list with topic and structure",
                PLAN_KEY
            )));
        }

        let blocks = value.get_mut(PLAN_KEY).map(Value::take).unwrap_or_default();
        let plans: Vec<MemoryBlockPlan> = serde_json::from_value(blocks)
            .map_err(|e| ReverieError::Validation(format!("malformed plan entry: {}", e)))?;

        for name in analysis.topic_names() {
            if !plans.iter().any(|p| p.topic == name) {
                warn!(topic = name, "no memory block planned for topic");
            }
        }

        info!(blocks = plans.len(), "planning complete");
        Ok(plans)
    }
}
