//! Storage engine for Reverie
//!
//! Handles SQLite database operations, WAL mode, and schema management.

mod backend;
mod connection;
mod migrations;
pub mod queries;

pub use backend::{HealthStatus, MemoryStore, StorageStats};
pub use connection::Storage;
pub use migrations::SCHEMA_VERSION;
