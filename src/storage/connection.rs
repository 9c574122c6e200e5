//! The SQLite file behind the transcript and memory store
//!
//! One connection serves the consolidation worker, the image sweep and the
//! HTTP handlers, one call at a time. The journal mode follows where the
//! database lives: WAL on a local disk, DELETE inside a synced folder.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use super::migrations::run_migrations;
use crate::error::Result;
use crate::types::{StorageConfig, StorageMode};

/// WAL keeps readers and the single writer apart on a local disk
const LOCAL_PRAGMAS: &str = "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;";

/// Sync clients copy the main file only, so nothing may live in a side journal
const CLOUD_SAFE_PRAGMAS: &str = "PRAGMA journal_mode=DELETE; PRAGMA synchronous=FULL;";

const COMMON_PRAGMAS: &str = "PRAGMA busy_timeout=30000; PRAGMA temp_store=MEMORY;";

/// Shared handle to the Reverie database; clones share the connection
pub struct Storage {
    config: StorageConfig,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open the database at `config.db_path`, creating it and its parent
    /// folders on first use, and bring the schema up to date
    pub fn open(config: StorageConfig) -> Result<Self> {
        let conn = Self::connect(&config)?;

        run_migrations(&conn)?;

        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Throwaway database for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StorageConfig {
            db_path: ":memory:".to_string(),
            storage_mode: StorageMode::Local,
        })
    }

    fn connect(config: &StorageConfig) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if config.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(&config.db_path, flags)?
        };

        let journal = match config.storage_mode {
            StorageMode::Local => LOCAL_PRAGMAS,
            StorageMode::CloudSafe => CLOUD_SAFE_PRAGMAS,
        };
        conn.execute_batch(journal)?;
        conn.execute_batch(COMMON_PRAGMAS)?;

        Ok(conn)
    }

    /// Run `f` while holding the connection; callers never keep it across
    /// an await
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.config.storage_mode
    }

    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    /// Whether the path looks like a Dropbox, OneDrive, iCloud or Google
    /// Drive folder
    pub fn is_in_cloud_folder(&self) -> bool {
        let path = self.config.db_path.to_lowercase();
        path.contains("dropbox")
            || path.contains("onedrive")
            || path.contains("icloud")
            || path.contains("google drive")
    }

    /// Warning to log at startup when a WAL database sits in a synced folder
    pub fn storage_mode_warning(&self) -> Option<String> {
        if self.is_in_cloud_folder() && self.config.storage_mode == StorageMode::Local {
            Some(format!(
                "Database '{}' appears to be in a cloud-synced folder. \
                WAL mode may cause corruption; set REVERIE_STORAGE_MODE=cloud-safe \
                or move the database to a local folder",
                self.config.db_path
            ))
        } else {
            None
        }
    }

    /// Size of the database in bytes, reported by the stats endpoint
    pub fn db_size(&self) -> Result<i64> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
        }
    }
}
