//! Core types for Reverie

use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use crate::error::{Result, ReverieError};

/// Identifier of a persisted memory block
pub type MemoryId = String;

/// Identifier of a stored transcript
pub type TranscriptId = String;

/// Fixed local timestamp layout. Lexical order equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H-%M-%S";

/// Date prefix of [`TIMESTAMP_FORMAT`]
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Format a local time in the store's timestamp layout
pub fn format_timestamp(dt: DateTime<Local>) -> String {
    dt.format(TIMESTAMP_FORMAT).to_string()
}

/// Current local time in the store's timestamp layout
pub fn now_timestamp() -> String {
    format_timestamp(Local::now())
}

/// Today's date prefix, e.g. `2025-01-23`
pub fn today_prefix() -> String {
    Local::now().format(DATE_FORMAT).to_string()
}

// ============================================================================
// Transcripts
// ============================================================================

/// A timestamped unit of captured speech awaiting consolidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub id: TranscriptId,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub timestamp: String,
}

impl TranscriptRecord {
    /// A transcript is usable only with both text and timestamp present
    pub fn is_valid(&self) -> bool {
        !self.text.trim().is_empty() && !self.timestamp.trim().is_empty()
    }
}

/// The transcripts fetched and processed together in one batch, in
/// timestamp order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranscriptBatch {
    records: Vec<TranscriptRecord>,
}

impl TranscriptBatch {
    pub fn new(records: Vec<TranscriptRecord>) -> Self {
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[TranscriptRecord] {
        &self.records
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.id.as_str())
    }

    /// Timestamp of the earliest record
    pub fn oldest_timestamp(&self) -> Option<&str> {
        self.records.iter().map(|r| r.timestamp.as_str()).min()
    }

    /// Transcript texts only, without ids or timestamps
    pub fn texts(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.text.as_str()).collect()
    }
}

impl FromIterator<TranscriptRecord> for TranscriptBatch {
    fn from_iter<I: IntoIterator<Item = TranscriptRecord>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// ============================================================================
// Analysis
// ============================================================================

/// Importance is 1-5; anything else is clamped, unreadable values become 3
fn deserialize_importance<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(importance_from_value(&value))
}

pub(crate) fn importance_from_value(value: &serde_json::Value) -> u8 {
    let raw = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match raw {
        Some(v) if v.is_finite() => v.round().clamp(1.0, 5.0) as u8,
        _ => default_importance(),
    }
}

fn default_importance() -> u8 {
    3
}

fn default_tone() -> String {
    "neutral".to_string()
}

/// A named cluster of related transcript sentences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    #[serde(default)]
    pub sentences: Vec<String>,
    #[serde(default = "default_tone")]
    pub emotional_tone: String,
    #[serde(
        default = "default_importance",
        deserialize_with = "deserialize_importance"
    )]
    pub importance: u8,
}

/// Where a conversation thread stands relative to earlier memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Continuation {
    #[default]
    New,
    Continuing,
    Concluding,
}

impl std::str::FromStr for Continuation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "new" => Ok(Continuation::New),
            "continuing" => Ok(Continuation::Continuing),
            "concluding" => Ok(Continuation::Concluding),
            _ => Err(format!("Unknown continuation: {}", s)),
        }
    }
}

impl<'de> Deserialize<'de> for Continuation {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Completions write things like "new/continuing"; fall back to New
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.and_then(|s| s.parse().ok()).unwrap_or_default())
    }
}

/// Context and sentiment layered onto a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationThread {
    pub topic: String,
    #[serde(default)]
    pub context: String,
    #[serde(default, alias = "related_memories")]
    pub related_memory_ids: Vec<String>,
    #[serde(default = "default_tone")]
    pub sentiment: String,
    #[serde(default)]
    pub continuation: Continuation,
}

impl ConversationThread {
    /// Mechanical thread for a topic: its sentences as context, its tone as
    /// sentiment, always a new conversation
    pub fn from_topic(topic: &Topic) -> Self {
        Self {
            topic: topic.name.clone(),
            context: topic.sentences.join(" "),
            related_memory_ids: Vec::new(),
            sentiment: topic.emotional_tone.clone(),
            continuation: Continuation::New,
        }
    }
}

/// Topics plus their conversation threads.
///
/// Every topic has a thread with the same name and every thread names a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub topics: Vec<Topic>,
    pub context: Vec<ConversationThread>,
}

impl Analysis {
    /// Distinct topic names in first-seen order
    pub fn topic_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for topic in &self.topics {
            if !names.contains(&topic.name.as_str()) {
                names.push(topic.name.as_str());
            }
        }
        names
    }

    pub fn thread_for(&self, topic: &str) -> Option<&ConversationThread> {
        self.context.iter().find(|t| t.topic == topic)
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Kind of block a plan asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    #[default]
    NewMemory,
}

/// Outline of the block to write for one topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlanStructure {
    #[serde(default)]
    pub main_points: Vec<String>,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub sentiment: String,
}

/// One planned memory block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlockPlan {
    pub topic: String,
    #[serde(rename = "type", default, deserialize_with = "deserialize_plan_kind")]
    pub kind: PlanKind,
    #[serde(
        default = "default_importance",
        deserialize_with = "deserialize_importance"
    )]
    pub priority: u8,
    pub structure: PlanStructure,
}

fn deserialize_plan_kind<'de, D>(deserializer: D) -> std::result::Result<PlanKind, D::Error>
where
    D: Deserializer<'de>,
{
    // Only one kind exists today; tolerate whatever the completion wrote
    let _ = serde_json::Value::deserialize(deserializer)?;
    Ok(PlanKind::NewMemory)
}

// ============================================================================
// Memory blocks
// ============================================================================

/// Content of a memory block as produced by the execution stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlockContent {
    pub topic: String,
    #[serde(default)]
    pub sentences: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub context: String,
    #[serde(default, alias = "dalle_prompt")]
    pub image_prompt: String,
    /// emotional_tone, importance_level, timestamp, conversation_type,
    /// visual_style, plus anything else the writer added
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance_level: Option<i64>,
}

impl MemoryBlockContent {
    /// Content needs a topic and at least one sentence
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(ReverieError::Validation(
                "memory content has an empty topic".to_string(),
            ));
        }
        if self.sentences.is_empty() {
            return Err(ReverieError::Validation(format!(
                "memory content '{}' has no sentences",
                self.topic
            )));
        }
        Ok(())
    }
}

/// A persisted memory block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub id: MemoryId,
    #[serde(flatten)]
    pub content: MemoryBlockContent,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

// ============================================================================
// Updates
// ============================================================================

/// A decided change to the memory store
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum MemoryUpdate {
    Create {
        content: MemoryBlockContent,
    },
    Update {
        memory_id: MemoryId,
        content: MemoryBlockContent,
    },
    Merge {
        source_memory_ids: Vec<MemoryId>,
        content: MemoryBlockContent,
    },
}

impl MemoryUpdate {
    pub fn action(&self) -> &'static str {
        match self {
            MemoryUpdate::Create { .. } => "create",
            MemoryUpdate::Update { .. } => "update",
            MemoryUpdate::Merge { .. } => "merge",
        }
    }

    pub fn content(&self) -> &MemoryBlockContent {
        match self {
            MemoryUpdate::Create { content }
            | MemoryUpdate::Update { content, .. }
            | MemoryUpdate::Merge { content, .. } => content,
        }
    }
}

/// An update exactly as a completion described it, not yet decoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawMemoryUpdate {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_memory_ids: Vec<String>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

impl TryFrom<RawMemoryUpdate> for MemoryUpdate {
    type Error = ReverieError;

    fn try_from(raw: RawMemoryUpdate) -> Result<Self> {
        let content_value = raw
            .content
            .ok_or_else(|| ReverieError::Validation("update missing content".to_string()))?;
        let content: MemoryBlockContent = serde_json::from_value(content_value)
            .map_err(|e| ReverieError::Validation(format!("malformed content: {}", e)))?;

        let action = raw.action.unwrap_or_default();
        let update = match action.trim().to_lowercase().as_str() {
            "create" => MemoryUpdate::Create { content },
            "update" => {
                let memory_id = raw
                    .memory_id
                    .filter(|id| !id.trim().is_empty())
                    .ok_or_else(|| {
                        ReverieError::Validation("update action requires memory_id".to_string())
                    })?;
                MemoryUpdate::Update { memory_id, content }
            }
            "merge" => {
                let mut source_memory_ids: Vec<MemoryId> = Vec::new();
                for id in raw.source_memory_ids {
                    if !id.trim().is_empty() && !source_memory_ids.contains(&id) {
                        source_memory_ids.push(id);
                    }
                }
                if source_memory_ids.is_empty() {
                    return Err(ReverieError::Validation(
                        "merge action requires source_memory_ids".to_string(),
                    ));
                }
                MemoryUpdate::Merge {
                    source_memory_ids,
                    content,
                }
            }
            _ => return Err(ReverieError::InvalidAction(action)),
        };

        update.content().validate()?;
        Ok(update)
    }
}

impl From<MemoryUpdate> for RawMemoryUpdate {
    fn from(update: MemoryUpdate) -> Self {
        let action = Some(update.action().to_string());
        let (memory_id, source_memory_ids, content) = match update {
            MemoryUpdate::Create { content } => (None, Vec::new(), content),
            MemoryUpdate::Update { memory_id, content } => (Some(memory_id), Vec::new(), content),
            MemoryUpdate::Merge {
                source_memory_ids,
                content,
            } => (None, source_memory_ids, content),
        };
        Self {
            action,
            memory_id,
            source_memory_ids,
            content: serde_json::to_value(content).ok(),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the storage engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    pub db_path: String,
    /// Storage mode (local or cloud-safe)
    #[serde(default)]
    pub storage_mode: StorageMode,
}

/// Storage mode for SQLite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    Local,
    CloudSafe,
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageMode::Local),
            "cloud-safe" => Ok(StorageMode::CloudSafe),
            _ => Err(format!("Unknown storage mode: {}", s)),
        }
    }
}

/// Default OpenAI-compatible endpoint (Groq)
pub const DEFAULT_COMPLETION_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Default completion model
pub const DEFAULT_COMPLETION_MODEL: &str = "qwen-2.5-32b";

/// Text completion provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Provider to use: "openai" (any OpenAI-compatible API)
    pub provider: String,
    pub api_key: Option<String>,
    /// Default: https://api.groq.com/openai/v1
    pub base_url: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub top_p: f32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: None,
            base_url: None,
            model: DEFAULT_COMPLETION_MODEL.to_string(),
            temperature: 0.3,
            max_tokens: Some(4096),
            top_p: 0.95,
        }
    }
}

/// What cleanup does with a batch once reconciliation has run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupPolicy {
    /// Delete every fetched transcript, even if some updates failed
    #[default]
    Always,
    /// Keep the batch for the next tick unless every update succeeded and
    /// every planned block was written
    RequireAllSucceeded,
}

impl std::str::FromStr for CleanupPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "always" => Ok(CleanupPolicy::Always),
            "require-all-succeeded" => Ok(CleanupPolicy::RequireAllSucceeded),
            _ => Err(format!("Unknown cleanup policy: {}", s)),
        }
    }
}

/// Consolidation schedule and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Seconds between batches
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Extra look-back added to the fetch window against clock jitter
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer_secs: u64,
    /// Limit for a single completion call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Limit for analysis, planning and execution together
    #[serde(default = "default_batch_deadline")]
    pub batch_deadline_secs: u64,
    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_safety_buffer() -> u64 {
    2
}

fn default_call_timeout() -> u64 {
    120
}

fn default_batch_deadline() -> u64 {
    900
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            safety_buffer_secs: default_safety_buffer(),
            call_timeout_secs: default_call_timeout(),
            batch_deadline_secs: default_batch_deadline(),
            cleanup_policy: CleanupPolicy::default(),
        }
    }
}

impl ConsolidationConfig {
    /// How far back a batch looks: poll interval plus safety buffer
    pub fn fetch_window(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.poll_interval_secs + self.safety_buffer_secs) as i64)
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.call_timeout_secs)
    }

    pub fn batch_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.batch_deadline_secs)
    }
}

/// Image generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    /// Default: https://api.openai.com/v1
    pub base_url: Option<String>,
    pub model: String,
    pub size: String,
    pub sweep_interval_secs: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            base_url: None,
            model: "dall-e-3".to_string(),
            size: "1024x1024".to_string(),
            sweep_interval_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content(topic: &str, sentences: &[&str]) -> serde_json::Value {
        json!({
            "topic": topic,
            "sentences": sentences,
            "summary": "s",
            "context": "c",
            "dalle_prompt": "a watercolor",
            "metadata": {"emotional_tone": "calm", "importance_level": 3}
        })
    }

    #[test]
    fn test_timestamp_is_lexically_sortable() {
        let earlier = Local::now() - chrono::Duration::seconds(90);
        let a = format_timestamp(earlier);
        let b = now_timestamp();
        assert!(a < b);
        assert_eq!(a.len(), "2025-01-23 12-37-24".len());
        assert!(b.starts_with(&today_prefix()));
    }

    #[test]
    fn test_topic_lenient_fields() {
        let topic: Topic = serde_json::from_value(json!({
            "name": "trip",
            "sentences": ["we leave friday"],
            "importance": "9"
        }))
        .unwrap();
        assert_eq!(topic.importance, 5);
        assert_eq!(topic.emotional_tone, "neutral");

        let topic: Topic =
            serde_json::from_value(json!({"name": "x", "importance": "1-5"})).unwrap();
        assert_eq!(topic.importance, 3);
    }

    #[test]
    fn test_thread_aliases_and_continuation() {
        let thread: ConversationThread = serde_json::from_value(json!({
            "topic": "trip",
            "related_memories": ["m1"],
            "continuation": "new/continuing/concluding"
        }))
        .unwrap();
        assert_eq!(thread.related_memory_ids, vec!["m1".to_string()]);
        assert_eq!(thread.continuation, Continuation::New);

        let thread: ConversationThread =
            serde_json::from_value(json!({"topic": "t", "continuation": "Concluding"})).unwrap();
        assert_eq!(thread.continuation, Continuation::Concluding);
    }

    #[test]
    fn test_decode_create_update_merge() {
        let create = MemoryUpdate::try_from(RawMemoryUpdate {
            action: Some("create".into()),
            content: Some(content("trip", &["a"])),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(create.action(), "create");
        assert_eq!(create.content().image_prompt, "a watercolor");

        let update = MemoryUpdate::try_from(RawMemoryUpdate {
            action: Some("update".into()),
            memory_id: Some("m1".into()),
            content: Some(content("trip", &["a"])),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(update, MemoryUpdate::Update { ref memory_id, .. } if memory_id == "m1"));

        let merge = MemoryUpdate::try_from(RawMemoryUpdate {
            action: Some("merge".into()),
            source_memory_ids: vec!["a".into(), "b".into(), "a".into()],
            content: Some(content("trip", &["a"])),
            ..Default::default()
        })
        .unwrap();
        match merge {
            MemoryUpdate::Merge {
                source_memory_ids, ..
            } => assert_eq!(source_memory_ids, vec!["a".to_string(), "b".to_string()]),
            other => panic!("expected merge, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_updates() {
        let err = MemoryUpdate::try_from(RawMemoryUpdate {
            action: Some("upsert".into()),
            content: Some(content("trip", &["a"])),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.kind(), "InvalidActionError");

        let err = MemoryUpdate::try_from(RawMemoryUpdate {
            action: Some("update".into()),
            content: Some(content("trip", &["a"])),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        let err = MemoryUpdate::try_from(RawMemoryUpdate {
            action: Some("create".into()),
            content: Some(content("trip", &[])),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn test_raw_roundtrip_from_typed() {
        let update = MemoryUpdate::Update {
            memory_id: "m9".into(),
            content: serde_json::from_value(content("trip", &["a"])).unwrap(),
        };
        let raw = RawMemoryUpdate::from(update.clone());
        assert_eq!(raw.action.as_deref(), Some("update"));
        assert_eq!(MemoryUpdate::try_from(raw).unwrap(), update);
    }

    #[test]
    fn test_fetch_window() {
        let config = ConsolidationConfig::default();
        assert_eq!(config.fetch_window(), chrono::Duration::seconds(62));
    }
}
