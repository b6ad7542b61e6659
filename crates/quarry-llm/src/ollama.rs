use ollama_rs::Ollama;
use ollama_rs::error::OllamaError;
use ollama_rs::generation::chat::ChatMessage;
use ollama_rs::generation::chat::request::ChatMessageRequest;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::models::ModelOptions;
use tokio_stream::StreamExt;

use crate::error::LlmError;
use crate::provider::{
    ChatStream, CompletionOptions, CompletionProvider, EmbeddingProvider, Message, Role,
};

const DEFAULT_PORT: u16 = 11434;

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Ollama,
    model: String,
    embedding_model: String,
}

impl OllamaProvider {
    #[must_use]
    pub fn new(base_url: &str, model: String, embedding_model: String) -> Self {
        let (host, port) = parse_host_port(base_url);
        Self {
            client: Ollama::new(host, port),
            model,
            embedding_model,
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Check if Ollama is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Unavailable`] if the server cannot be contacted.
    pub async fn health_check(&self) -> Result<(), LlmError> {
        self.client
            .list_local_models()
            .await
            .map_err(|e| LlmError::Unavailable(format!("failed to connect to Ollama: {e}")))?;
        Ok(())
    }

    /// Send a minimal chat request so Ollama loads the model before the first real turn.
    ///
    /// # Errors
    ///
    /// Returns an error if the warmup request fails.
    pub async fn warmup(&self) -> Result<(), LlmError> {
        let request =
            ChatMessageRequest::new(self.model.clone(), vec![ChatMessage::user("hi".to_owned())]);
        self.client
            .send_chat_messages(request)
            .await
            .map_err(classify_error)?;
        Ok(())
    }
}

impl EmbeddingProvider for OllamaProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let request = GenerateEmbeddingsRequest::new(
            self.embedding_model.clone(),
            EmbeddingsInput::from(text),
        );

        let response = self
            .client
            .generate_embeddings(request)
            .await
            .map_err(classify_error)?;

        response
            .embeddings
            .into_iter()
            .next()
            .ok_or(LlmError::EmptyResponse { provider: "ollama" })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = GenerateEmbeddingsRequest::new(
            self.embedding_model.clone(),
            EmbeddingsInput::Multiple(texts.to_vec()),
        );

        let response = self
            .client
            .generate_embeddings(request)
            .await
            .map_err(classify_error)?;

        if response.embeddings.len() != texts.len() {
            tracing::warn!(
                expected = texts.len(),
                got = response.embeddings.len(),
                "ollama returned a short embedding batch"
            );
            return Err(LlmError::EmptyResponse { provider: "ollama" });
        }
        Ok(response.embeddings)
    }

    fn model_tag(&self) -> &str {
        &self.embedding_model
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

impl CompletionProvider for OllamaProvider {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<ChatStream, LlmError> {
        let ollama_messages: Vec<ChatMessage> = messages.iter().map(convert_message).collect();
        let request = ChatMessageRequest::new(self.model.clone(), ollama_messages).options(
            ModelOptions::default()
                .temperature(options.temperature)
                .top_k(options.top_k)
                .top_p(options.top_p),
        );

        let stream = self
            .client
            .send_chat_messages_stream(request)
            .await
            .map_err(classify_error)?;

        let mapped = stream.map(|item| match item {
            Ok(response) => Ok(response.message.content),
            Err(()) => Err(LlmError::Unavailable("ollama stream interrupted".into())),
        });

        Ok(Box::pin(mapped))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

fn convert_message(msg: &Message) -> ChatMessage {
    match msg.role {
        Role::System => ChatMessage::system(msg.content.clone()),
        Role::Assistant => ChatMessage::assistant(msg.content.clone()),
        Role::User => ChatMessage::user(msg.content.clone()),
    }
}

/// Transport failures and crashed runners are transient. Only an explicit refusal of the input
/// becomes [`LlmError::ContentRejected`]; other server errors stay generic.
fn classify_error(err: OllamaError) -> LlmError {
    match err {
        OllamaError::ReqwestError(e) if e.is_decode() => LlmError::Other(e.to_string()),
        OllamaError::ReqwestError(e) => LlmError::Unavailable(e.to_string()),
        OllamaError::JsonError(e) => LlmError::Json(e),
        OllamaError::InternalError(e) => classify_message(e.message),
        // ollama-rs reports a non-2xx status as the raw response body.
        OllamaError::Other(body) => classify_message(server_message(body)),
        other => LlmError::Other(other.to_string()),
    }
}

/// Pull `error` out of an Ollama `{"error": "..."}` body.
fn server_message(body: String) -> String {
    serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error")?.as_str().map(str::to_owned))
        .unwrap_or(body)
}

const TRANSIENT_MARKERS: &[&str] = &[
    "error sending request",
    "connect",
    "timed out",
    "broken pipe",
    "connection reset",
    "unexpected eof",
    "runner process",
    "server busy",
    "overloaded",
];

const REFUSAL_MARKERS: &[&str] = &[
    "violates",
    "policy",
    "refused to",
    "refuses to",
    "safety",
    "not allowed",
    "disallowed",
    "blocked",
];

fn classify_message(message: String) -> LlmError {
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        LlmError::Unavailable(message)
    } else if REFUSAL_MARKERS.iter().any(|m| lower.contains(m)) {
        LlmError::ContentRejected(message)
    } else {
        LlmError::Other(message)
    }
}

fn parse_host_port(url: &str) -> (String, u16) {
    let url = url.trim_end_matches('/');
    if let Some(colon_pos) = url.rfind(':') {
        let port_str = &url[colon_pos + 1..];
        if let Ok(port) = port_str.parse::<u16>() {
            let host = url[..colon_pos].to_string();
            return (host, port);
        }
    }
    (url.to_string(), DEFAULT_PORT)
}
