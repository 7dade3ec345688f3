//! Error types for metrics indexer operations

use thiserror::Error;

/// Result type for metrics indexer operations
pub type IndexerResult<T> = Result<T, IndexerError>;

/// Error types surfaced by the indexer pipeline
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported schema version: {0}")]
    SchemaVersion(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Indexer backend error: {0}")]
    Backend(String),

    #[error("Cardinality limiter error: {0}")]
    Limiter(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Background worker error: {0}")]
    Worker(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IndexerError {
    /// Create a new parse error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend(message.into())
    }

    /// Create a new limiter error
    pub fn limiter<S: Into<String>>(message: S) -> Self {
        Self::Limiter(message.into())
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a new worker error
    pub fn worker<S: Into<String>>(message: S) -> Self {
        Self::Worker(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Whether redelivering the same batch may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            IndexerError::Backend(_)
                | IndexerError::Limiter(_)
                | IndexerError::Worker(_)
                | IndexerError::Io(_)
        )
    }

    /// Get the error category for monitoring/metrics
    pub fn category(&self) -> &'static str {
        match self {
            IndexerError::Parse(_) => "parse",
            IndexerError::SchemaVersion(_) => "schema_version",
            IndexerError::Validation(_) => "validation",
            IndexerError::Backend(_) => "backend",
            IndexerError::Limiter(_) => "limiter",
            IndexerError::Configuration(_) => "configuration",
            IndexerError::Worker(_) => "worker",
            IndexerError::Internal(_) => "internal",
            IndexerError::Io(_) => "io",
            IndexerError::Json(_) => "json",
        }
    }
}
