#[cfg(feature = "mock")]
use crate::mock::MockProvider;
use crate::ollama::OllamaProvider;

use crate::error::LlmError;
use crate::provider::{
    ChatStream, CompletionOptions, CompletionProvider, EmbeddingProvider, Message,
};

/// Generates a match over all `AnyProvider` variants, binding the inner provider
/// and evaluating the given expression for each arm.
macro_rules! delegate_provider {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            AnyProvider::Ollama($p) => $expr,
            #[cfg(feature = "mock")]
            AnyProvider::Mock($p) => $expr,
        }
    };
}

/// Backend selected by configuration. Local vs remote is a config choice, not a type change.
#[derive(Debug, Clone)]
pub enum AnyProvider {
    Ollama(OllamaProvider),
    #[cfg(feature = "mock")]
    Mock(MockProvider),
}

impl AnyProvider {
    /// Probe the backend where the backend supports it.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Unavailable`] if the backend cannot be reached.
    pub async fn health_check(&self) -> Result<(), LlmError> {
        match self {
            Self::Ollama(p) => p.health_check().await,
            #[cfg(feature = "mock")]
            Self::Mock(_) => Ok(()),
        }
    }
}

impl EmbeddingProvider for AnyProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        delegate_provider!(self, |p| p.embed(text).await)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        delegate_provider!(self, |p| p.embed_batch(texts).await)
    }

    fn model_tag(&self) -> &str {
        delegate_provider!(self, |p| p.model_tag())
    }

    fn name(&self) -> &'static str {
        delegate_provider!(self, |p| EmbeddingProvider::name(p))
    }
}

impl CompletionProvider for AnyProvider {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<ChatStream, LlmError> {
        delegate_provider!(self, |p| p.complete(messages, options).await)
    }

    fn name(&self) -> &'static str {
        delegate_provider!(self, |p| CompletionProvider::name(p))
    }
}
