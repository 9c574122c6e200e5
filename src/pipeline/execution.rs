//! Execution stage: one completion per planned block
//!
//! Entries are independent. A failure on one plan entry is logged and that
//! entry is skipped; the stage only fails when no entry produced an update.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::prompts;
use super::validate::{self, UPDATE_KEY};
use crate::error::{Result, ReverieError};
use crate::llm::decode::object_decoder;
use crate::llm::{complete_within, TextCompletion};
use crate::types::{now_timestamp, MemoryBlockPlan, RawMemoryUpdate, TranscriptBatch};

/// Updates produced by the stage plus the topics whose entries were skipped
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionOutcome {
    pub updates: Vec<RawMemoryUpdate>,
    pub skipped: Vec<String>,
}

pub struct ExecutionStage {
    completer: Arc<dyn TextCompletion>,
    call_timeout: Duration,
}

impl ExecutionStage {
    pub fn new(completer: Arc<dyn TextCompletion>, call_timeout: Duration) -> Self {
        Self {
            completer,
            call_timeout,
        }
    }

    /// Entries run one after another; their order does not matter.
    pub async fn execute(
        &self,
        plans: &[MemoryBlockPlan],
        batch: &TranscriptBatch,
    ) -> Result<ExecutionOutcome> {
        let texts = batch.texts();
        let mut outcome = ExecutionOutcome::default();
        let mut reasons = Vec::new();

        for plan in plans {
            match self.write_block(plan, &texts).await {
                Ok(update) => outcome.updates.push(update),
                Err(e) => {
                    warn!(topic = %plan.topic, kind = e.kind(), error = %e, "skipping planned block");
                    reasons.push(format!("'{}' ({})", plan.topic, e.kind()));
                    outcome.skipped.push(plan.topic.clone());
                }
            }
        }

        if outcome.updates.is_empty() {
            return Err(ReverieError::NoUpdates(format!(
                "all {} planned blocks were skipped: {}",
                plans.len(),
                reasons.join(", ")
            )));
        }

        info!(
            updates = outcome.updates.len(),
            skipped = outcome.skipped.len(),
            "execution complete"
        );
        Ok(outcome)
    }

    async fn write_block(&self, plan: &MemoryBlockPlan, texts: &[&str]) -> Result<RawMemoryUpdate> {
        let prompt = prompts::execution_prompt(plan, texts, &now_timestamp())?;
        let text = complete_within(self.completer.as_ref(), &prompt, self.call_timeout).await?;
        debug!(topic = %plan.topic, response = %text, "execution completion");

        let mut value = object_decoder().decode(&text)?;
        let update = value.get_mut(UPDATE_KEY).map(Value::take).unwrap_or_default();
        if !validate::is_memory_update(&update) {
            return Err(ReverieError::Validation(format!(
                "missing or malformed '{}'",
                UPDATE_KEY
            )));
        }

        // The action is decoded later, so unknown actions reach reconciliation
        serde_json::from_value(update)
            .map_err(|e| ReverieError::Validation(format!("malformed update: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedCompletion, ScriptedReply};
    use crate::types::{PlanKind, PlanStructure, TranscriptRecord};

    fn plan(topic: &str) -> MemoryBlockPlan {
        MemoryBlockPlan {
            topic: topic.into(),
            kind: PlanKind::NewMemory,
            priority: 3,
            structure: PlanStructure::default(),
        }
    }

    fn batch() -> TranscriptBatch {
        vec![TranscriptRecord {
            id: "t1".into(),
            text: "we leave friday".into(),
            timestamp: "2025-01-23 10-00-00".into(),
        }]
        .into_iter()
        .collect()
    }

    fn update_reply(topic: &str) -> String {
        format!(
            r#"{{"memory_update": {{"action": "create", "content": {{"topic": "{}", "sentences": ["we leave friday"]}}}}}}"#,
            topic
        )
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_entry() {
        let completer = Arc::new(ScriptedCompletion::new(vec![
            ScriptedReply::Text(update_reply("trip")),
            ScriptedReply::Text("no idea".into()),
            ScriptedReply::Fail("503 from provider".into()),
            ScriptedReply::Text(r#"{"memory_update": null}"#.into()),
            ScriptedReply::Text(update_reply("work")),
        ]));
        let stage = ExecutionStage::new(completer.clone(), Duration::from_secs(5));
        let plans: Vec<_> = ["trip", "a", "b", "c", "work"].into_iter().map(plan).collect();

        let outcome = stage.execute(&plans, &batch()).await.unwrap();
        assert_eq!(outcome.updates.len(), 2);
        assert_eq!(outcome.skipped, vec!["a", "b", "c"]);
        assert_eq!(completer.prompts().len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_action_is_passed_through() {
        let reply = r#"{"memory_update": {"action": "upsert", "content": {"topic": "trip", "sentences": ["x"]}}}"#;
        let stage = ExecutionStage::new(
            Arc::new(ScriptedCompletion::from_texts([reply])),
            Duration::from_secs(5),
        );

        let outcome = stage.execute(&[plan("trip")], &batch()).await.unwrap();
        assert_eq!(outcome.updates[0].action.as_deref(), Some("upsert"));
    }

    #[tokio::test]
    async fn test_zero_updates_is_an_error() {
        let stage = ExecutionStage::new(
            Arc::new(ScriptedCompletion::from_texts(["{}", "```json\n{}\n```"])),
            Duration::from_secs(5),
        );

        let plans = [plan("trip"), plan("work")];
        let err = stage.execute(&plans, &batch()).await.unwrap_err();
        assert_eq!(err.kind(), "NoUpdatesError");
        assert_eq!(
            err.to_string(),
            "No usable updates: all 2 planned blocks were skipped: 'trip' (ValidationError), 'work' (ValidationError)"
        );
    }

    #[tokio::test]
    async fn test_slow_entry_times_out_and_is_skipped() {
        let completer = Arc::new(ScriptedCompletion::new(vec![
            ScriptedReply::Stall(Duration::from_secs(5)),
            ScriptedReply::Text(update_reply("work")),
        ]));
        let stage = ExecutionStage::new(completer, Duration::from_millis(20));

        let outcome = stage
            .execute(&[plan("trip"), plan("work")], &batch())
            .await
            .unwrap();
        assert_eq!(outcome.skipped, vec!["trip"]);
        assert_eq!(outcome.updates.len(), 1);
    }
}
