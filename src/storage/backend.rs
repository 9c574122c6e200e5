//! Storage backend trait consumed by the consolidation pipeline
//!
//! The pipeline, the image sweep and the HTTP API only ever see a
//! `MemoryStore`, so the SQLite engine can be swapped for another document
//! store without touching them.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

use super::connection::Storage;
use super::queries;
use crate::error::Result;
use crate::types::{
    MemoryBlock, MemoryBlockContent, MemoryId, StorageMode, TranscriptId, TranscriptRecord,
};

/// Statistics about the store
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub total_memories: i64,
    pub memories_with_images: i64,
    /// Transcripts not yet consumed by a batch
    pub pending_transcriptions: i64,
    pub oldest_pending: Option<String>,
    pub db_size_bytes: Option<i64>,
    /// e.g. "sqlite-wal", "sqlite-delete"
    pub storage_mode: String,
    pub schema_version: i32,
}

/// Health status of the storage backend
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Latency of a simple query in milliseconds
    pub latency_ms: f64,
    pub error: Option<String>,
    pub details: HashMap<String, String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            latency_ms: 0.0,
            error: None,
            details: HashMap::new(),
        }
    }
}

/// Document store holding transcripts and memory blocks.
///
/// Timestamps are opaque strings in [`crate::types::TIMESTAMP_FORMAT`];
/// range queries are inclusive.
pub trait MemoryStore: Send + Sync {
    /// Transcripts at or after `since` (all when `None`), oldest first.
    /// Records are returned as stored, including ones missing text.
    fn get_transcriptions(&self, since: Option<&str>) -> Result<Vec<TranscriptRecord>>;

    fn create_transcription(&self, text: &str, timestamp: &str) -> Result<TranscriptId>;

    fn delete_transcription(&self, id: &str) -> Result<()>;

    fn get_memory(&self, id: &str) -> Result<Option<MemoryBlock>>;

    /// All memory blocks, newest timestamp first
    fn get_memories(&self) -> Result<Vec<MemoryBlock>>;

    /// Blocks whose timestamp falls on the given `YYYY-MM-DD` day
    fn get_memories_on(&self, date: &str) -> Result<Vec<MemoryBlock>>;

    fn create_memory(&self, content: &MemoryBlockContent, timestamp: &str) -> Result<MemoryId>;

    /// Overwrite an existing block; `NotFound` if the id is unknown
    fn update_memory(&self, block: &MemoryBlock) -> Result<()>;

    fn delete_memory(&self, id: &str) -> Result<()>;

    /// Set only the `image_url` of a block; `NotFound` if the id is unknown.
    /// Content and `last_updated` are left as they are in the store.
    fn set_image_url(&self, id: &str, url: &str) -> Result<()>;

    fn stats(&self) -> Result<StorageStats>;

    fn health_check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        let status = match self.stats() {
            Ok(_) => HealthStatus::default(),
            Err(e) => HealthStatus {
                healthy: false,
                error: Some(e.to_string()),
                ..Default::default()
            },
        };
        Ok(HealthStatus {
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            ..status
        })
    }
}

impl MemoryStore for Storage {
    fn get_transcriptions(&self, since: Option<&str>) -> Result<Vec<TranscriptRecord>> {
        self.with_connection(|conn| queries::list_transcriptions(conn, since, None))
    }

    fn create_transcription(&self, text: &str, timestamp: &str) -> Result<TranscriptId> {
        self.with_connection(|conn| queries::create_transcription(conn, text, timestamp))
    }

    fn delete_transcription(&self, id: &str) -> Result<()> {
        self.with_connection(|conn| queries::delete_transcription(conn, id))
    }

    fn get_memory(&self, id: &str) -> Result<Option<MemoryBlock>> {
        self.with_connection(|conn| queries::get_memory(conn, id))
    }

    fn get_memories(&self) -> Result<Vec<MemoryBlock>> {
        self.with_connection(|conn| queries::list_memories(conn, None, None))
    }

    fn get_memories_on(&self, date: &str) -> Result<Vec<MemoryBlock>> {
        self.with_connection(|conn| queries::list_memories(conn, Some(date), None))
    }

    fn create_memory(&self, content: &MemoryBlockContent, timestamp: &str) -> Result<MemoryId> {
        self.with_connection(|conn| queries::create_memory(conn, content, timestamp))
    }

    fn update_memory(&self, block: &MemoryBlock) -> Result<()> {
        self.with_connection(|conn| queries::update_memory(conn, block))
    }

    fn delete_memory(&self, id: &str) -> Result<()> {
        self.with_connection(|conn| queries::delete_memory(conn, id))
    }

    fn set_image_url(&self, id: &str, url: &str) -> Result<()> {
        self.with_connection(|conn| queries::set_image_url(conn, id, url))
    }

    fn stats(&self) -> Result<StorageStats> {
        let mut stats = self.with_connection(queries::get_stats)?;
        stats.db_size_bytes = self.db_size().ok();
        stats.storage_mode = match self.storage_mode() {
            StorageMode::Local => "sqlite-wal".to_string(),
            StorageMode::CloudSafe => "sqlite-delete".to_string(),
        };
        Ok(stats)
    }

    fn health_check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        let ping = self.with_connection(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(Into::into)
        });
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut details = HashMap::new();
        details.insert("db_path".to_string(), self.db_path().to_string());

        Ok(match ping {
            Ok(_) => HealthStatus {
                healthy: true,
                latency_ms,
                error: None,
                details,
            },
            Err(e) => HealthStatus {
                healthy: false,
                latency_ms,
                error: Some(e.to_string()),
                details,
            },
        })
    }
}
