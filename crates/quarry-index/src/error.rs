//! Error types for quarry-index.

/// Errors that can occur while indexing or querying.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The backing store cannot be reached or the index was closed.
    #[error("index unavailable: {0}")]
    Unavailable(String),

    /// Query or entry dimensionality differs from the index configuration.
    #[error("dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The on-disk database could not be read back.
    #[error("index database corrupted: {0}")]
    Corrupted(String),

    /// IO error reading source files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `SQLite` database error.
    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Embedding provider error.
    #[error("LLM error: {0}")]
    Llm(#[from] quarry_llm::LlmError),

    /// Content could not be turned into text.
    #[error("extraction failed: {0}")]
    Extract(#[from] crate::extractor::ExtractError),

    /// Tree-sitter parsing error.
    #[error("parse failed: {0}")]
    Parse(String),

    /// File watcher error.
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// The pipeline has shut down.
    #[error("indexing queue closed")]
    QueueClosed,

    /// Generic catch-all error.
    #[error("{0}")]
    Other(String),
}

impl IndexError {
    /// Failures that a later attempt can fix. Extraction and configuration errors are final.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Llm(e) => e.is_transient(),
            Self::Io(_) | Self::Sqlite(_) | Self::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
