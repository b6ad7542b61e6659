//! Test-only mock provider with deterministic embeddings and scripted completions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;

use crate::error::LlmError;
use crate::provider::{
    ChatStream, CompletionOptions, CompletionProvider, EmbeddingProvider, Message,
};

/// Scripted failure for the next completion call.
#[derive(Debug, Clone)]
pub enum MockFailure {
    Unavailable,
    Rejected(String),
    /// Emit this many fragments, then fail with `Unavailable`.
    BreakAfter(usize),
}

#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<Vec<MockFailure>>>,
    overrides: Arc<Mutex<HashMap<String, Vec<f32>>>>,
    prompts: Arc<Mutex<Vec<Vec<Message>>>>,
    embed_failures: Arc<AtomicUsize>,
    embed_calls: Arc<AtomicUsize>,
    aborted: Arc<AtomicBool>,
    pub default_response: String,
    pub dimension: usize,
    pub model_tag: String,
    /// Milliseconds between streamed fragments.
    pub chunk_delay_ms: u64,
    /// Milliseconds to sleep inside every embedding call.
    pub embed_delay_ms: u64,
    /// Never emit a fragment; the stream stays open until dropped.
    pub hang: bool,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(Vec::new())),
            overrides: Arc::new(Mutex::new(HashMap::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
            embed_failures: Arc::new(AtomicUsize::new(0)),
            embed_calls: Arc::new(AtomicUsize::new(0)),
            aborted: Arc::new(AtomicBool::new(false)),
            default_response: "mock response".into(),
            dimension: 64,
            model_tag: "mock-embed-v1".into(),
            chunk_delay_ms: 0,
            embed_delay_ms: 0,
            hang: false,
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    #[must_use]
    pub fn with_chunk_delay(mut self, ms: u64) -> Self {
        self.chunk_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn with_embed_delay(mut self, ms: u64) -> Self {
        self.embed_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Queue a failure for an upcoming completion call.
    pub fn push_failure(&self, failure: MockFailure) {
        self.failures.lock().unwrap().push(failure);
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push(response.into());
    }

    /// Make the next `n` embedding calls fail with `Unavailable`.
    pub fn fail_next_embeds(&self, n: usize) {
        self.embed_failures.store(n, Ordering::SeqCst);
    }

    /// Pin the vector returned for an exact text.
    pub fn set_embedding(&self, text: impl Into<String>, vector: Vec<f32>) {
        self.overrides.lock().unwrap().insert(text.into(), vector);
    }

    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Message lists passed to every completion call so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts.lock().unwrap().clone()
    }

    /// True once a consumer dropped a stream before it finished.
    #[must_use]
    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Deterministic bag-of-words vector: identical texts map to identical unit vectors.
    #[must_use]
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.overrides.lock().unwrap().get(text) {
            return v.clone();
        }
        let mut v = vec![0.0f32; self.dimension.max(1)];
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let hash = blake3::hash(word.to_lowercase().as_bytes());
            let bytes = hash.as_bytes();
            let idx = usize::from(u16::from_le_bytes([bytes[0], bytes[1]])) % v.len();
            let sign = if bytes[2] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            v[0] = 1.0;
        } else {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    fn take_embed_failure(&self) -> bool {
        self.embed_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl EmbeddingProvider for MockProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut out = self.embed_batch(&[text.to_owned()]).await?;
        out.pop().ok_or(LlmError::EmptyResponse { provider: "mock" })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.embed_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.embed_delay_ms)).await;
        }
        if self.take_embed_failure() {
            return Err(LlmError::Unavailable("mock embedder offline".into()));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_tag(&self) -> &str {
        &self.model_tag
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

impl CompletionProvider for MockProvider {
    async fn complete(
        &self,
        messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<ChatStream, LlmError> {
        self.prompts.lock().unwrap().push(messages.to_vec());

        let failure = {
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };
        let break_after = match failure {
            Some(MockFailure::Unavailable) => {
                return Err(LlmError::Unavailable("mock provider offline".into()));
            }
            Some(MockFailure::Rejected(msg)) => return Err(LlmError::ContentRejected(msg)),
            Some(MockFailure::BreakAfter(n)) => Some(n),
            None => None,
        };

        let response = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                self.default_response.clone()
            } else {
                responses.remove(0)
            }
        };

        let fragments: Vec<String> = response
            .split_inclusive(' ')
            .map(ToOwned::to_owned)
            .collect();
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let delay = Duration::from_millis(self.chunk_delay_ms);
        let hang = self.hang;
        let aborted = Arc::clone(&self.aborted);

        tokio::spawn(async move {
            if hang {
                tx.closed().await;
                aborted.store(true, Ordering::SeqCst);
                return;
            }
            for (i, fragment) in fragments.into_iter().enumerate() {
                if break_after == Some(i) {
                    let _ = tx
                        .send(Err(LlmError::Unavailable("mock stream broke".into())))
                        .await;
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(fragment)).await.is_err() {
                    aborted.store(true, Ordering::SeqCst);
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
