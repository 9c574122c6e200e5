//! Reverie - memory consolidation for captured speech
//!
//! Short timestamped transcripts are grouped into topics by a language model,
//! planned into memory blocks and reconciled against a persistent store.

pub mod api;
pub mod error;
pub mod images;
pub mod llm;
pub mod pipeline;
pub mod storage;
pub mod types;

pub use error::{Result, ReverieError, StageError};
pub use storage::{MemoryStore, Storage};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
