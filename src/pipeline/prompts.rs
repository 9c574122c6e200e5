//! Prompt builders for the four completion calls of a batch

use serde_json::json;

use super::validate::{PLAN_KEY, THREADS_KEY, TOPICS_KEY, UPDATE_KEY};
use crate::error::Result;
use crate::types::{Analysis, MemoryBlockPlan};

const JSON_ONLY: &str = "Answer with the JSON object alone. No prose before or after it.";

/// Topic decomposition. Sees transcript texts only.
pub fn topic_prompt(texts: &[&str]) -> String {
    format!(
        r#"Group the following spoken transcripts into topics. Look at what was said, not at how the list is laid out.

Transcripts:
{texts:#}

{JSON_ONLY}
Shape:
{{
  "{TOPICS_KEY}": [
    {{
      "name": "short specific topic name",
      "sentences": ["sentence belonging to this topic"],
      "emotional_tone": "a few words",
      "importance": 3
    }}
  ]
}}

Every topic needs a "name". "importance" is an integer from 1 (trivial) to 5 (vital)."#,
        texts = json!(texts),
    )
}

/// Conversation-thread decomposition. Sees topic names only.
pub fn thread_prompt(topic_names: &[&str]) -> String {
    format!(
        r#"For each topic below, describe the conversation it comes from.

Topics:
{names:#}

{JSON_ONLY}
Shape:
{{
  "{THREADS_KEY}": [
    {{
      "topic": "topic name copied exactly from the list",
      "context": "what the conversation was about",
      "related_memory_ids": [],
      "sentiment": "positive, negative or neutral",
      "continuation": "new, continuing or concluding"
    }}
  ]
}}

Write exactly one thread per topic and reuse the topic names verbatim."#,
        names = json!(topic_names),
    )
}

/// Memory plan over the full analysis and the transcript texts
pub fn plan_prompt(analysis: &Analysis, texts: &[&str]) -> Result<String> {
    let analysis = serde_json::to_value(analysis)?;
    Ok(format!(
        r#"Decide which memory blocks to write for this batch of conversation.

Analysis:
{analysis:#}

Transcripts:
{texts:#}

{JSON_ONLY}
Shape:
{{
  "{PLAN_KEY}": [
    {{
      "topic": "topic name",
      "type": "new_memory",
      "priority": 3,
      "structure": {{
        "main_points": ["point"],
        "context": "context of the block",
        "sentiment": "tone of the conversation"
      }}
    }}
  ]
}}

Plan at least one block for every topic in the analysis. Leave out filler and noise."#,
        texts = json!(texts),
    ))
}

/// Content of one planned block, stamped with the time of writing
pub fn execution_prompt(plan: &MemoryBlockPlan, texts: &[&str], timestamp: &str) -> Result<String> {
    let plan = serde_json::to_value(plan)?;
    Ok(format!(
        r#"Write the memory block described by this plan.

Plan:
{plan:#}

Transcripts:
{texts:#}

{JSON_ONLY}
Shape:
{{
  "{UPDATE_KEY}": {{
    "action": "create",
    "content": {{
      "topic": "topic name from the plan",
      "sentences": ["cleaned-up sentence from the transcripts"],
      "summary": "one or two sentences",
      "context": "fuller context",
      "image_prompt": "prompt for an illustration of this memory",
      "metadata": {{
        "emotional_tone": "tone",
        "importance_level": 3,
        "timestamp": "{timestamp}",
        "conversation_type": "kind of conversation",
        "visual_style": "style for the illustration"
      }}
    }}
  }}
}}

Keep every relevant sentence and its original meaning."#,
        texts = json!(texts),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationThread, PlanKind, PlanStructure, Topic};

    fn analysis() -> Analysis {
        let topic = Topic {
            name: "trip".into(),
            sentences: vec!["we leave friday".into()],
            emotional_tone: "excited".into(),
            importance: 4,
        };
        Analysis {
            context: vec![ConversationThread::from_topic(&topic)],
            topics: vec![topic],
        }
    }

    #[test]
    fn test_topic_prompt_lists_texts_only() {
        let prompt = topic_prompt(&["we leave friday", "pack the tent"]);
        assert!(prompt.contains("\"we leave friday\""));
        assert!(prompt.contains("\"pack the tent\""));
        assert!(prompt.contains("\"topics\""));
    }

    #[test]
    fn test_thread_prompt_lists_names_only() {
        let prompt = thread_prompt(&["trip"]);
        assert!(prompt.contains("\"trip\""));
        assert!(prompt.contains("\"conversation_threads\""));
        assert!(!prompt.contains("we leave friday"));
    }

    #[test]
    fn test_plan_and_execution_prompts() {
        let plan_text = plan_prompt(&analysis(), &["we leave friday"]).unwrap();
        assert!(plan_text.contains("\"excited\""));
        assert!(plan_text.contains("\"memory_blocks\""));

        let plan = MemoryBlockPlan {
            topic: "trip".into(),
            kind: PlanKind::NewMemory,
            priority: 4,
            structure: PlanStructure::default(),
        };
        let exec = execution_prompt(&plan, &["we leave friday"], "2025-01-23 10-00-00").unwrap();
        assert!(exec.contains("\"new_memory\""));
        assert!(exec.contains("2025-01-23 10-00-00"));
        assert!(exec.contains("\"memory_update\""));
    }
}
