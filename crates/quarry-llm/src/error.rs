#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The backend could not be reached or refused the connection.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its deadline.
    #[error("provider timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The backend declined the input. The message is kept verbatim.
    #[error("{0}")]
    ContentRejected(String),

    #[error("empty response from {provider}")]
    EmptyResponse { provider: &'static str },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Errors worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
