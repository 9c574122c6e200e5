//! Error types for Reverie

use thiserror::Error;

/// Result type alias for Reverie operations
pub type Result<T> = std::result::Result<T, ReverieError>;

/// Main error type for Reverie
#[derive(Error, Debug)]
pub enum ReverieError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unparseable completion: {0}")]
    Parse(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("No usable updates: {0}")]
    NoUpdates(String),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "openai")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(not(feature = "openai"))]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReverieError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReverieError::Completion(_) | ReverieError::Timeout(_) | ReverieError::Http(_)
        )
    }

    /// Name of the error class, as recorded in stats and API responses
    pub fn kind(&self) -> &'static str {
        match self {
            ReverieError::Database(_) | ReverieError::Storage(_) | ReverieError::Io(_) => {
                "PersistenceError"
            }
            ReverieError::NotFound(_) => "NotFoundError",
            ReverieError::Validation(_) => "ValidationError",
            ReverieError::Parse(_) | ReverieError::Serialization(_) => "ParseError",
            ReverieError::InvalidAction(_) => "InvalidActionError",
            ReverieError::NoUpdates(_) => "NoUpdatesError",
            ReverieError::Completion(_) | ReverieError::Http(_) => "CompletionError",
            ReverieError::Timeout(_) => "TimeoutError",
            ReverieError::Config(_) => "ConfigError",
            ReverieError::Unavailable(_) => "UnavailableError",
            ReverieError::Internal(_) => "InternalError",
        }
    }
}

/// A failure that abandons a whole consolidation batch.
///
/// Transcripts of a batch that ends in one of these are never deleted, so
/// they are picked up again by the next tick.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("fetching transcripts failed: {0}")]
    Fetch(#[source] ReverieError),

    #[error("analysis failed: {0}")]
    Analysis(#[source] ReverieError),

    #[error("planning failed: {0}")]
    Planning(#[source] ReverieError),

    #[error("execution failed: {0}")]
    Execution(#[source] ReverieError),

    #[error("batch deadline of {0}s exceeded")]
    Deadline(u64),
}

impl StageError {
    /// Error type name recorded as `last_error.type`
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Fetch(_) => "PersistenceError",
            StageError::Analysis(_) => "AnalysisError",
            StageError::Planning(_) => "PlanningError",
            StageError::Execution(_) => "ExecutionError",
            StageError::Deadline(_) => "TimeoutError",
        }
    }

    /// The underlying crate error, when there is one
    pub fn cause(&self) -> Option<&ReverieError> {
        match self {
            StageError::Fetch(e)
            | StageError::Analysis(e)
            | StageError::Planning(e)
            | StageError::Execution(e) => Some(e),
            StageError::Deadline(_) => None,
        }
    }

    /// Whether the next batch may succeed on the same transcripts without
    /// anything changing, i.e. the provider or the clock was at fault
    pub fn is_retryable(&self) -> bool {
        self.cause().map_or(true, ReverieError::is_retryable)
    }
}
