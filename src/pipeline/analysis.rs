//! Analysis stage: transcripts to topics and conversation threads
//!
//! Two completion calls. The topic call must decode or the batch is lost.
//! The thread call falls back to threads built mechanically from the topics,
//! so a sloppy second answer never costs the batch.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::prompts;
use super::validate::{self, THREADS_KEY, TOPICS_KEY};
use crate::error::{Result, ReverieError};
use crate::llm::decode::{fenced_json_object, json_object, object_decoder, LenientDecoder};
use crate::llm::{complete_within, TextCompletion};
use crate::types::{Analysis, ConversationThread, Topic, TranscriptBatch};

pub struct AnalysisStage {
    completer: Arc<dyn TextCompletion>,
    call_timeout: Duration,
}

impl AnalysisStage {
    pub fn new(completer: Arc<dyn TextCompletion>, call_timeout: Duration) -> Self {
        Self {
            completer,
            call_timeout,
        }
    }

    /// Decompose a batch into topics and one conversation thread per topic
    pub async fn analyze(&self, batch: &TranscriptBatch) -> Result<Analysis> {
        if batch.is_empty() {
            return Err(ReverieError::Validation(
                "cannot analyze an empty batch".to_string(),
            ));
        }

        let topics = self.extract_topics(batch).await?;
        let threads = self.extract_threads(&topics).await?;
        let analysis = Analysis {
            context: align_threads(&topics, threads),
            topics,
        };

        debug_assert!(validate::is_aligned(&analysis));
        info!(
            topics = analysis.topics.len(),
            threads = analysis.context.len(),
            "analysis complete"
        );
        Ok(analysis)
    }

    async fn extract_topics(&self, batch: &TranscriptBatch) -> Result<Vec<Topic>> {
        let prompt = prompts::topic_prompt(&batch.texts());
        let text = complete_within(self.completer.as_ref(), &prompt, self.call_timeout).await?;
        debug!(response = %text, "topic completion");

        let mut value = object_decoder().decode(&text)?;
        let repaired = validate::normalize_topic_names(&mut value);
        if repaired > 0 {
            warn!(repaired, "topics without a name were repaired");
        }
        if !validate::has_topics(&value) {
            return Err(ReverieError::Validation(format!(
                "topic response has no usable '{}' list",
                TOPICS_KEY
            )));
        }

        let topics = value.get_mut(TOPICS_KEY).map(Value::take).unwrap_or_default();
        serde_json::from_value(topics)
            .map_err(|e| ReverieError::Validation(format!("malformed topics: {}", e)))
    }

    async fn extract_threads(&self, topics: &[Topic]) -> Result<Vec<ConversationThread>> {
        let names: Vec<&str> = topics.iter().map(|t| t.name.as_str()).collect();
        let prompt = prompts::thread_prompt(&names);
        let text = complete_within(self.completer.as_ref(), &prompt, self.call_timeout).await?;
        debug!(response = %text, "thread completion");

        thread_decoder(topics).decode(&text)
    }
}

/// Strict, then fenced, then rebuilt from the topics. Never fails once at
/// least one topic exists.
fn thread_decoder(topics: &[Topic]) -> LenientDecoder<'_, Vec<ConversationThread>> {
    LenientDecoder::new()
        .attempt("strict", |text| threads_from_value(json_object(text)?))
        .attempt("fenced", |text| threads_from_value(fenced_json_object(text)?))
        .attempt("reconstruct", move |_| {
            warn!(
                topics = topics.len(),
                "thread response unusable, rebuilding threads from topics"
            );
            Ok(topics.iter().map(ConversationThread::from_topic).collect())
        })
}

fn threads_from_value(mut value: Value) -> Result<Vec<ConversationThread>> {
    if !validate::is_thread_set(&value) {
        return Err(ReverieError::Validation(format!(
            "missing or malformed '{}'",
            THREADS_KEY
        )));
    }
    let threads = value.get_mut(THREADS_KEY).map(Value::take).unwrap_or_default();
    serde_json::from_value(threads)
        .map_err(|e| ReverieError::Validation(format!("malformed threads: {}", e)))
}

/// One thread per distinct topic name, in topic order. Threads naming an
/// unknown topic are dropped; topics without a thread get a mechanical one.
fn align_threads(topics: &[Topic], threads: Vec<ConversationThread>) -> Vec<ConversationThread> {
    let mut remaining = threads;
    let mut aligned: Vec<ConversationThread> = Vec::with_capacity(topics.len());

    for topic in topics {
        if aligned.iter().any(|t| t.topic == topic.name) {
            continue;
        }
        match remaining.iter().position(|t| t.topic == topic.name) {
            Some(index) => aligned.push(remaining.swap_remove(index)),
            None => {
                debug!(topic = %topic.name, "no thread returned for topic, building one");
                aligned.push(ConversationThread::from_topic(topic));
            }
        }
    }

    for orphan in remaining {
        if !aligned.iter().any(|t| t.topic == orphan.topic) {
            warn!(topic = %orphan.topic, "dropping thread for unknown topic");
        }
    }
    aligned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedCompletion;
    use crate::types::{Continuation, TranscriptRecord};
    use pretty_assertions::assert_eq;

    fn batch() -> TranscriptBatch {
        vec![
            TranscriptRecord {
                id: "t1".into(),
                text: "we leave for the coast on friday".into(),
                timestamp: "2025-01-23 10-00-00".into(),
            },
            TranscriptRecord {
                id: "t2".into(),
                text: "remember to pack the tent".into(),
                timestamp: "2025-01-23 10-00-05".into(),
            },
        ]
        .into_iter()
        .collect()
    }

    const TOPICS: &str = r#"{"topics": [{"name": "trip", "sentences": ["we leave for the coast on friday", "remember to pack the tent"], "emotional_tone": "excited", "importance": 4}]}"#;

    fn stage(replies: Vec<&str>) -> (AnalysisStage, Arc<ScriptedCompletion>) {
        let completer = Arc::new(ScriptedCompletion::from_texts(replies));
        (
            AnalysisStage::new(completer.clone(), Duration::from_secs(5)),
            completer,
        )
    }

    #[tokio::test]
    async fn test_analyze_with_clean_responses() {
        let threads = r#"{"conversation_threads": [{"topic": "trip", "context": "planning a weekend away", "related_memories": ["m1"], "sentiment": "positive", "continuation": "continuing"}]}"#;
        let (stage, completer) = stage(vec![TOPICS, threads]);

        let analysis = stage.analyze(&batch()).await.unwrap();
        assert_eq!(analysis.topic_names(), vec!["trip"]);
        let thread = analysis.thread_for("trip").unwrap();
        assert_eq!(thread.continuation, Continuation::Continuing);
        assert_eq!(thread.related_memory_ids, vec!["m1".to_string()]);

        let prompts = completer.prompts();
        assert!(prompts[0].contains("remember to pack the tent"));
        assert!(!prompts[1].contains("remember to pack the tent"));
    }

    #[tokio::test]
    async fn test_fenced_topics_are_accepted() {
        let fenced = format!("```json\n{}\n```", TOPICS);
        let (stage, _) = stage(vec![fenced.as_str(), "```json\n{\"conversation_threads\": []}\n```"]);

        let analysis = stage.analyze(&batch()).await.unwrap();
        assert_eq!(analysis.topics.len(), 1);
        // empty thread list is filled from the topics
        assert_eq!(analysis.context[0].context, analysis.topics[0].sentences.join(" "));
    }

    #[tokio::test]
    async fn test_missing_thread_root_rebuilds_threads() {
        let (stage, _) = stage(vec![TOPICS, r#"{"threads": "sorry"}"#]);

        let analysis = stage.analyze(&batch()).await.unwrap();
        assert_eq!(
            analysis.context,
            vec![ConversationThread::from_topic(&analysis.topics[0])]
        );
        assert_eq!(analysis.context[0].sentiment, "excited");
        assert_eq!(analysis.context[0].continuation, Continuation::New);
    }

    #[tokio::test]
    async fn test_garbage_topics_are_fatal() {
        let (stage, completer) = stage(vec!["I'm not sure what you mean."]);

        let err = stage.analyze(&batch()).await.unwrap_err();
        assert_eq!(err.kind(), "ParseError");
        // the thread call is never made
        assert_eq!(completer.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_legacy_topic_field_is_repaired() {
        let topics = r#"{"topics": [{"topic": "trip", "sentences": ["pack the tent"]}]}"#;
        let (stage, _) = stage(vec![topics, "not json"]);

        let analysis = stage.analyze(&batch()).await.unwrap();
        assert_eq!(analysis.topics[0].name, "trip");
        assert_eq!(analysis.topics[0].importance, 3);
        assert!(validate::is_aligned(&analysis));
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let (stage, completer) = stage(vec![]);
        assert!(stage.analyze(&TranscriptBatch::default()).await.is_err());
        assert!(completer.prompts().is_empty());
    }

    #[test]
    fn test_align_drops_unknown_and_fills_missing() {
        let trip = Topic {
            name: "trip".into(),
            sentences: vec!["a".into()],
            emotional_tone: "calm".into(),
            importance: 2,
        };
        let work = Topic {
            name: "work".into(),
            ..trip.clone()
        };
        let stray = ConversationThread {
            topic: "gardening".into(),
            ..ConversationThread::from_topic(&trip)
        };
        let mut work_thread = ConversationThread::from_topic(&work);
        work_thread.context = "quarterly review".into();

        let aligned = align_threads(&[trip.clone(), work], vec![stray, work_thread]);
        assert_eq!(aligned.len(), 2);
        assert_eq!(aligned[0], ConversationThread::from_topic(&trip));
        assert_eq!(aligned[1].context, "quarterly review");
    }
}
