//! Reconciliation: applying decided updates against the memory store
//!
//! Every update is applied in its own failure domain. An error on one update
//! is tallied and logged, then the next update is attempted.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, ReverieError};
use crate::storage::MemoryStore;
use crate::types::{now_timestamp, MemoryBlock, MemoryBlockContent, MemoryId, MemoryUpdate, RawMemoryUpdate};

/// Tally of one `apply` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyResult {
    pub succeeded: usize,
    pub failed: usize,
}

impl ApplyResult {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn MemoryStore>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }

    /// Decode and apply each update. Never fails as a whole; unknown actions
    /// and malformed payloads count as failed updates.
    pub fn apply(&self, updates: Vec<RawMemoryUpdate>) -> ApplyResult {
        info!(count = updates.len(), "applying memory updates");

        updates
            .into_iter()
            .enumerate()
            .fold(ApplyResult::default(), |mut tally, (index, raw)| {
                match MemoryUpdate::try_from(raw).and_then(|update| self.apply_update(update)) {
                    Ok(_) => tally.succeeded += 1,
                    Err(e) => {
                        warn!(index, kind = e.kind(), error = %e, "memory update failed");
                        tally.failed += 1;
                    }
                }
                tally
            })
    }

    /// Apply one decoded update and return the id of the block it wrote
    pub fn apply_update(&self, update: MemoryUpdate) -> Result<MemoryId> {
        let now = now_timestamp();

        match update {
            MemoryUpdate::Create { content } => {
                let id = self.store.create_memory(&content, &now)?;
                info!(id = %id, topic = %content.topic, "created memory block");
                Ok(id)
            }
            MemoryUpdate::Update { memory_id, content } => {
                let existing = self
                    .store
                    .get_memory(&memory_id)?
                    .ok_or_else(|| ReverieError::NotFound(format!("memory {}", memory_id)))?;
                let merged = merge_memory_content(existing, &content, &now);
                self.store.update_memory(&merged)?;
                info!(
                    id = %memory_id,
                    added = content.sentences.len(),
                    "updated memory block"
                );
                Ok(memory_id)
            }
            MemoryUpdate::Merge {
                source_memory_ids,
                content,
            } => {
                let id = self.store.create_memory(&content, &now)?;
                for source in &source_memory_ids {
                    if let Err(e) = self.store.delete_memory(source) {
                        warn!(source = %source, merged_into = %id, error = %e, "could not delete merged source");
                    }
                }
                info!(
                    id = %id,
                    sources = source_memory_ids.len(),
                    "merged memory blocks"
                );
                Ok(id)
            }
        }
    }
}

/// Fold new content into an existing block.
///
/// Sentences are appended without deduplication. `context`, `emotional_tone`
/// and `importance_level` are overwritten only when the new content carries a
/// value. Metadata is a shallow merge where new keys win.
pub fn merge_memory_content(
    mut existing: MemoryBlock,
    new: &MemoryBlockContent,
    now: &str,
) -> MemoryBlock {
    let block = &mut existing.content;

    block.sentences.extend(new.sentences.iter().cloned());
    if !new.context.is_empty() {
        block.context = new.context.clone();
    }
    if new.emotional_tone.is_some() {
        block.emotional_tone = new.emotional_tone.clone();
    }
    if new.importance_level.is_some() {
        block.importance_level = new.importance_level;
    }
    block
        .metadata
        .extend(new.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

    existing.last_updated = Some(now.to_string());
    existing
}
