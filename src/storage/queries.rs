//! Database queries for transcripts and memory blocks

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, ReverieError};
use crate::types::*;

use super::backend::StorageStats;
use super::migrations::SCHEMA_VERSION;

/// Columns of a `memories` row: id, content JSON, timestamp, last_updated, image_url
type MemoryRow = (MemoryId, String, String, Option<String>, Option<String>);

/// Parse a memory block row; the content JSON is decoded by the caller
pub fn memory_from_row(row: &Row) -> rusqlite::Result<MemoryRow> {
    Ok((
        row.get("id")?,
        row.get("content")?,
        row.get("timestamp")?,
        row.get("last_updated")?,
        row.get("image_url")?,
    ))
}

fn block_from_parts((id, content, timestamp, last_updated, image_url): MemoryRow) -> Result<MemoryBlock> {
    let content: MemoryBlockContent = serde_json::from_str(&content)?;
    Ok(MemoryBlock {
        id,
        content,
        timestamp,
        last_updated,
        image_url,
    })
}

/// Parse a transcript from a database row
pub fn transcript_from_row(row: &Row) -> rusqlite::Result<TranscriptRecord> {
    Ok(TranscriptRecord {
        id: row.get("id")?,
        text: row.get::<_, Option<String>>("text")?.unwrap_or_default(),
        timestamp: row.get::<_, Option<String>>("timestamp")?.unwrap_or_default(),
    })
}

// ============================================================================
// Transcripts
// ============================================================================

/// Store a transcript and return its id
pub fn create_transcription(conn: &Connection, text: &str, timestamp: &str) -> Result<TranscriptId> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO transcriptions (id, text, timestamp) VALUES (?, ?, ?)",
        params![id, text, timestamp],
    )?;
    Ok(id)
}

/// List transcripts in timestamp order; both bounds are inclusive
pub fn list_transcriptions(
    conn: &Connection,
    since: Option<&str>,
    until: Option<&str>,
) -> Result<Vec<TranscriptRecord>> {
    let mut sql = String::from("SELECT id, text, timestamp FROM transcriptions WHERE 1=1");
    let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();

    if let Some(ref since) = since {
        sql.push_str(" AND timestamp >= ?");
        values.push(since);
    }
    if let Some(ref until) = until {
        sql.push_str(" AND timestamp <= ?");
        values.push(until);
    }
    sql.push_str(" ORDER BY timestamp ASC, id ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(values.as_slice(), transcript_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(ReverieError::from)
}

/// Delete a transcript
pub fn delete_transcription(conn: &Connection, id: &str) -> Result<()> {
    let affected = conn.execute("DELETE FROM transcriptions WHERE id = ?", params![id])?;
    if affected == 0 {
        return Err(ReverieError::NotFound(format!("transcription {}", id)));
    }
    Ok(())
}

// ============================================================================
// Memory blocks
// ============================================================================

/// Persist content as a new memory block
pub fn create_memory(
    conn: &Connection,
    content: &MemoryBlockContent,
    timestamp: &str,
) -> Result<MemoryId> {
    let id = uuid::Uuid::new_v4().to_string();
    let content_json = serde_json::to_string(content)?;

    conn.execute(
        "INSERT INTO memories (id, topic, content, timestamp) VALUES (?, ?, ?, ?)",
        params![id, content.topic, content_json, timestamp],
    )?;

    Ok(id)
}

/// Get a memory block by id
pub fn get_memory(conn: &Connection, id: &str) -> Result<Option<MemoryBlock>> {
    let parts = conn
        .query_row(
            "SELECT id, content, timestamp, last_updated, image_url FROM memories WHERE id = ?",
            params![id],
            memory_from_row,
        )
        .optional()?;

    parts.map(block_from_parts).transpose()
}

/// List memory blocks, newest timestamp first
///
/// `date_prefix` keeps only blocks whose timestamp starts with it
/// (e.g. `2025-01-23` for one day).
pub fn list_memories(
    conn: &Connection,
    date_prefix: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<MemoryBlock>> {
    let pattern = date_prefix.map(|p| format!("{}%", p));
    let mut stmt = conn.prepare(
        "SELECT id, content, timestamp, last_updated, image_url FROM memories
         WHERE (?1 IS NULL OR timestamp LIKE ?1)
         ORDER BY timestamp DESC, id ASC
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(params![pattern, limit.unwrap_or(-1)], memory_from_row)?;

    let mut blocks = Vec::new();
    for parts in rows {
        blocks.push(block_from_parts(parts?)?);
    }
    Ok(blocks)
}

/// Overwrite a memory block in place
pub fn update_memory(conn: &Connection, block: &MemoryBlock) -> Result<()> {
    let content_json = serde_json::to_string(&block.content)?;
    let affected = conn.execute(
        "UPDATE memories
         SET topic = ?, content = ?, timestamp = ?, last_updated = ?, image_url = ?
         WHERE id = ?",
        params![
            block.content.topic,
            content_json,
            block.timestamp,
            block.last_updated,
            block.image_url,
            block.id
        ],
    )?;

    if affected == 0 {
        return Err(ReverieError::NotFound(format!("memory {}", block.id)));
    }
    Ok(())
}

/// Attach an image to a memory block, leaving its content untouched
pub fn set_image_url(conn: &Connection, id: &str, url: &str) -> Result<()> {
    let affected = conn.execute(
        "UPDATE memories SET image_url = ? WHERE id = ?",
        params![url, id],
    )?;
    if affected == 0 {
        return Err(ReverieError::NotFound(format!("memory {}", id)));
    }
    Ok(())
}

/// Delete a memory block
pub fn delete_memory(conn: &Connection, id: &str) -> Result<()> {
    let affected = conn.execute("DELETE FROM memories WHERE id = ?", params![id])?;
    if affected == 0 {
        return Err(ReverieError::NotFound(format!("memory {}", id)));
    }
    Ok(())
}

/// Counts for the stats endpoint and CLI
pub fn get_stats(conn: &Connection) -> Result<StorageStats> {
    let total_memories: i64 =
        conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
    let memories_with_images: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE image_url IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    let pending_transcriptions: i64 =
        conn.query_row("SELECT COUNT(*) FROM transcriptions", [], |row| row.get(0))?;
    let oldest_pending: Option<String> = conn.query_row(
        "SELECT MIN(timestamp) FROM transcriptions",
        [],
        |row| row.get(0),
    )?;

    Ok(StorageStats {
        total_memories,
        memories_with_images,
        pending_transcriptions,
        oldest_pending,
        schema_version: SCHEMA_VERSION,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use serde_json::json;
    use std::collections::HashMap;

    fn content(topic: &str) -> MemoryBlockContent {
        let mut metadata = HashMap::new();
        metadata.insert("emotional_tone".to_string(), json!("calm"));
        MemoryBlockContent {
            topic: topic.to_string(),
            sentences: vec!["one".to_string()],
            summary: "summary".to_string(),
            context: "context".to_string(),
            image_prompt: "prompt".to_string(),
            metadata,
            emotional_tone: None,
            importance_level: None,
        }
    }

    #[test]
    fn test_transcription_window_is_inclusive() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                create_transcription(conn, "before", "2025-01-23 12-00-00")?;
                let edge = create_transcription(conn, "edge", "2025-01-23 12-01-00")?;
                create_transcription(conn, "after", "2025-01-23 12-02-00")?;

                let since = list_transcriptions(conn, Some("2025-01-23 12-01-00"), None)?;
                assert_eq!(since.len(), 2);
                assert_eq!(since[0].id, edge);

                let between = list_transcriptions(
                    conn,
                    Some("2025-01-23 12-00-00"),
                    Some("2025-01-23 12-01-00"),
                )?;
                assert_eq!(
                    between.iter().map(|t| t.text.as_str()).collect::<Vec<_>>(),
                    vec!["before", "edge"]
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_null_text_reads_as_empty() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO transcriptions (id, text, timestamp) VALUES ('t1', NULL, '2025-01-01 00-00-00')",
                    [],
                )?;
                let all = list_transcriptions(conn, None, None)?;
                assert_eq!(all.len(), 1);
                assert!(!all[0].is_valid());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_memory_crud() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let id = create_memory(conn, &content("trip"), "2025-01-23 12-00-00")?;
                let mut block = get_memory(conn, &id)?.expect("block exists");
                assert_eq!(block.content.topic, "trip");
                assert_eq!(block.last_updated, None);

                block.content.sentences.push("two".to_string());
                block.last_updated = Some("2025-01-23 13-00-00".to_string());
                block.image_url = Some("https://img/1.png".to_string());
                update_memory(conn, &block)?;
                assert_eq!(get_memory(conn, &id)?, Some(block.clone()));

                set_image_url(conn, &id, "https://img/2.png")?;
                let reread = get_memory(conn, &id)?.expect("block exists");
                assert_eq!(reread.image_url.as_deref(), Some("https://img/2.png"));
                assert_eq!(reread.content, block.content);
                assert_eq!(reread.last_updated, block.last_updated);

                delete_memory(conn, &id)?;
                assert!(get_memory(conn, &id)?.is_none());
                assert!(matches!(
                    set_image_url(conn, &id, "https://img/3.png"),
                    Err(ReverieError::NotFound(_))
                ));
                assert!(matches!(
                    delete_memory(conn, &id),
                    Err(ReverieError::NotFound(_))
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_list_memories_newest_first_and_by_day() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                create_memory(conn, &content("old"), "2025-01-22 09-00-00")?;
                create_memory(conn, &content("new"), "2025-01-23 09-00-00")?;
                create_memory(conn, &content("newest"), "2025-01-23 18-00-00")?;

                let all = list_memories(conn, None, None)?;
                let topics: Vec<_> = all.iter().map(|m| m.content.topic.as_str()).collect();
                assert_eq!(topics, vec!["newest", "new", "old"]);

                let day = list_memories(conn, Some("2025-01-23"), None)?;
                assert_eq!(day.len(), 2);

                let limited = list_memories(conn, None, Some(1))?;
                assert_eq!(limited[0].content.topic, "newest");

                let stats = get_stats(conn)?;
                assert_eq!(stats.total_memories, 3);
                assert_eq!(stats.pending_transcriptions, 0);
                Ok(())
            })
            .unwrap();
    }
}
