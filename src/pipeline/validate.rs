//! Shape checks for intermediate results
//!
//! Pure predicates over decoded completion JSON. They only say whether a value
//! has the structure the next stage reads, never whether its content is any good.

use serde_json::Value;

use crate::types::Analysis;

/// Root key of the topic decomposition
pub const TOPICS_KEY: &str = "topics";
/// Root key of the conversation-thread decomposition
pub const THREADS_KEY: &str = "conversation_threads";
/// Root key of a memory plan
pub const PLAN_KEY: &str = "memory_blocks";
/// Root key of a single execution result
pub const UPDATE_KEY: &str = "memory_update";

const UNKNOWN_TOPIC: &str = "Unknown Topic";

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// A non-empty `topics` array of named topic objects
pub fn has_topics(value: &Value) -> bool {
    match value.get(TOPICS_KEY).and_then(Value::as_array) {
        Some(topics) => {
            !topics.is_empty()
                && topics
                    .iter()
                    .all(|t| t.is_object() && non_empty_str(t.get("name")).is_some())
        }
        None => false,
    }
}

/// Give every topic object a `name`, taken from the legacy `topic` field when
/// present. Returns how many topics were repaired.
pub fn normalize_topic_names(value: &mut Value) -> usize {
    let Some(topics) = value.get_mut(TOPICS_KEY).and_then(Value::as_array_mut) else {
        return 0;
    };

    let mut repaired = 0;
    for topic in topics.iter_mut() {
        let Some(fields) = topic.as_object_mut() else {
            continue;
        };
        if non_empty_str(fields.get("name")).is_some() {
            continue;
        }
        let name = non_empty_str(fields.get("topic"))
            .unwrap_or(UNKNOWN_TOPIC)
            .to_string();
        fields.insert("name".to_string(), Value::String(name));
        repaired += 1;
    }
    repaired
}

/// A `conversation_threads` array whose entries all name a topic
pub fn is_thread_set(value: &Value) -> bool {
    value
        .get(THREADS_KEY)
        .and_then(Value::as_array)
        .is_some_and(|threads| {
            threads
                .iter()
                .all(|t| t.is_object() && non_empty_str(t.get("topic")).is_some())
        })
}

/// Every topic has a thread of the same name and every thread names a topic
pub fn is_aligned(analysis: &Analysis) -> bool {
    let names = analysis.topic_names();
    names.iter().all(|name| analysis.thread_for(name).is_some())
        && analysis
            .context
            .iter()
            .all(|thread| names.contains(&thread.topic.as_str()))
}

/// A non-empty `memory_blocks` array whose entries carry `topic` and `structure`
pub fn is_plan(value: &Value) -> bool {
    match value.get(PLAN_KEY).and_then(Value::as_array) {
        Some(blocks) => {
            !blocks.is_empty()
                && blocks.iter().all(|b| {
                    b.is_object()
                        && non_empty_str(b.get("topic")).is_some()
                        && b.get("structure").is_some_and(Value::is_object)
                })
        }
        None => false,
    }
}

/// An update object with both `action` and `content`
pub fn is_memory_update(value: &Value) -> bool {
    value.is_object()
        && value.get("action").is_some_and(|a| !a.is_null())
        && value.get("content").is_some_and(Value::is_object)
}
