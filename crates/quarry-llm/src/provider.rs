use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Lazy, finite sequence of completion text fragments.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters forwarded to the completion backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 50,
            top_p: 0.85,
        }
    }
}

/// Text to fixed-dimension vector.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Unavailable`] when the backend cannot be reached.
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, LlmError>> + Send;

    /// Embed several texts, preserving input order in the output.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Unavailable`] when the backend cannot be reached and
    /// [`LlmError::EmptyResponse`] when the result count does not match the input.
    fn embed_batch(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, LlmError>> + Send;

    /// Tag identifying the embedding model. Vectors from different tags are not comparable.
    fn model_tag(&self) -> &str;

    fn name(&self) -> &'static str;
}

/// Streaming text generation.
pub trait CompletionProvider: Send + Sync {
    /// Start a completion. The returned stream is not restartable; dropping it aborts the call.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Unavailable`] or [`LlmError::ContentRejected`] when the request
    /// cannot be started.
    fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> impl Future<Output = Result<ChatStream, LlmError>> + Send;

    fn name(&self) -> &'static str;
}

/// Run `fut` with a deadline, mapping expiry to [`LlmError::Timeout`].
///
/// # Errors
///
/// Returns [`LlmError::Timeout`] when the deadline passes, otherwise the inner result.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, LlmError>
where
    F: Future<Output = Result<T, LlmError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documented_values() {
        let opts = CompletionOptions::default();
        assert!((opts.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(opts.top_k, 50);
        assert!((opts.top_p - 0.85).abs() < f32::EPSILON);
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[tokio::test]
    async fn with_timeout_passes_through_result() {
        let value = with_timeout(Duration::from_secs(1), async { Ok::<_, LlmError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_maps_elapsed() {
        let result = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, LlmError>(())
        })
        .await;
        assert!(matches!(result, Err(LlmError::Timeout(d)) if d == Duration::from_millis(50)));
    }
}
