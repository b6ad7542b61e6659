use std::time::Duration;

use quarry_llm::LlmError;

/// Errors returned synchronously by the orchestrator control API.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The session already has an active turn.
    #[error("session {0} already has an active turn")]
    SessionBusy(String),

    /// The completion provider failed recently and is cooling down.
    #[error("completion provider unavailable, retry in {}s", .retry_in.as_secs())]
    ProviderUnavailable { retry_in: Duration },

    #[error("orchestrator is shut down")]
    Shutdown,
}

/// Errors delivered inside a turn's event stream.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("completion provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("completion provider timed out after {0:?}")]
    ProviderTimeout(Duration),

    /// The provider declined the input. Shown to the user as-is.
    #[error("{0}")]
    ContentRejected(String),

    #[error("completion failed: {0}")]
    Provider(String),
}

impl TurnError {
    /// Worth another completion attempt before any output reached the consumer.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_) | Self::ProviderTimeout(_))
    }
}

impl From<LlmError> for TurnError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Unavailable(msg) => Self::ProviderUnavailable(msg),
            LlmError::Timeout(limit) => Self::ProviderTimeout(limit),
            LlmError::ContentRejected(msg) => Self::ContentRejected(msg),
            other => Self::Provider(other.to_string()),
        }
    }
}

/// Sub-agent failures. These never fail a turn; the orchestrator logs and skips them.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent {0} is disabled")]
    Disabled(&'static str),

    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path {0} is outside the workspace")]
    OutsideWorkspace(String),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_errors_map_to_turn_errors() {
        assert_eq!(
            TurnError::from(LlmError::Unavailable("down".into())),
            TurnError::ProviderUnavailable("down".into())
        );
        assert_eq!(
            TurnError::from(LlmError::Timeout(Duration::from_secs(3))),
            TurnError::ProviderTimeout(Duration::from_secs(3))
        );
        assert!(matches!(
            TurnError::from(LlmError::EmptyResponse { provider: "ollama" }),
            TurnError::Provider(_)
        ));
    }

    #[test]
    fn rejection_is_verbatim_and_not_transient() {
        let err = TurnError::from(LlmError::ContentRejected("input violates policy".into()));
        assert_eq!(err.to_string(), "input violates policy");
        assert!(!err.is_transient());
        assert!(TurnError::ProviderTimeout(Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn unavailable_reports_cooldown() {
        let err = OrchestratorError::ProviderUnavailable {
            retry_in: Duration::from_secs(12),
        };
        assert_eq!(err.to_string(), "completion provider unavailable, retry in 12s");
    }
}
