use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use quarry_index::chunker::ChunkerConfig;
use quarry_index::extractor::DEFAULT_MAX_FILE_BYTES;
use quarry_index::scanner::{DEFAULT_MAX_FILES, ScanConfig};
use quarry_index::{PipelineConfig, RetrievalConfig as RetrieverConfig};
use quarry_llm::provider::CompletionOptions;
use quarry_llm::retry::Backoff;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant answering questions about a \
local code base. Use the retrieved context when it is relevant and cite the source file for \
facts taken from it. If the context does not contain the answer, say so instead of guessing.";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Ollama,
    Mock,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Mock => "mock",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    #[serde(default = "default_first_token_timeout_secs")]
    pub first_token_timeout_secs: u64,
    #[serde(default = "default_embedding_timeout_secs")]
    pub embedding_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:11434".into()
}

fn default_model() -> String {
    "llama3.1".into()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_k() -> u32 {
    50
}

fn default_top_p() -> f32 {
    0.85
}

fn default_completion_timeout_secs() -> u64 {
    120
}

fn default_first_token_timeout_secs() -> u64 {
    60
}

fn default_embedding_timeout_secs() -> u64 {
    30
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: default_base_url(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            completion_timeout_secs: default_completion_timeout_secs(),
            first_token_timeout_secs: default_first_token_timeout_secs(),
            embedding_timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl LlmConfig {
    #[must_use]
    pub fn completion_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// `;`-separated include prefixes relative to `root`.
    #[serde(default = "default_sources")]
    pub sources: String,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_chunk_max_size")]
    pub chunk_max_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_true")]
    pub watch: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_rescan_after_days")]
    pub rescan_after_days: u64,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_sources() -> String {
    "src/".into()
}

fn default_max_files() -> usize {
    DEFAULT_MAX_FILES
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".quarry/index.db")
}

fn default_chunk_max_size() -> usize {
    500
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_debounce_ms() -> u64 {
    750
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_workers() -> usize {
    4
}

fn default_embed_batch_size() -> usize {
    10
}

fn default_embed_concurrency() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_max_file_bytes() -> u64 {
    DEFAULT_MAX_FILE_BYTES
}

fn default_rescan_after_days() -> u64 {
    7
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            sources: default_sources(),
            max_files: default_max_files(),
            db_path: default_db_path(),
            chunk_max_size: default_chunk_max_size(),
            chunk_overlap: default_chunk_overlap(),
            debounce_ms: default_debounce_ms(),
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            embed_batch_size: default_embed_batch_size(),
            embed_concurrency: default_embed_concurrency(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            watch: true,
            max_file_bytes: default_max_file_bytes(),
            rescan_after_days: default_rescan_after_days(),
        }
    }
}

impl IndexConfig {
    #[must_use]
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig::from_sources(&self.sources, self.max_files)
    }

    /// Database location; relative paths are resolved against `root`.
    #[must_use]
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.is_absolute() {
            self.db_path.clone()
        } else {
            self.root.join(&self.db_path)
        }
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn rescan_after(&self) -> Duration {
        Duration::from_secs(self.rescan_after_days.saturating_mul(24 * 60 * 60))
    }

    #[must_use]
    pub fn pipeline_config(&self, embed_timeout: Duration) -> PipelineConfig {
        PipelineConfig {
            chunker: ChunkerConfig {
                max_size: self.chunk_max_size,
                overlap: self.chunk_overlap,
            },
            debounce: self.debounce(),
            queue_capacity: self.queue_capacity.max(1),
            workers: self.workers.max(1),
            embed_batch_size: self.embed_batch_size.max(1),
            embed_concurrency: self.embed_concurrency.max(1),
            embed_timeout,
            max_retries: self.max_retries,
            backoff: Backoff {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_millis(self.backoff_max_ms),
            },
            max_file_bytes: self.max_file_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub enabled: bool,
    pub top_k: usize,
    pub overfetch: usize,
    pub min_score: f32,
    pub recency_weight: f32,
    pub recency_half_life_hours: u64,
    pub pinned_boost: f32,
    pub dedupe_similarity: f32,
    pub min_chunk_chars: usize,
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 4,
            overfetch: 3,
            min_score: 0.25,
            recency_weight: 0.1,
            recency_half_life_hours: 72,
            pinned_boost: 0.05,
            dedupe_similarity: 0.97,
            min_chunk_chars: 30,
            timeout_secs: 10,
        }
    }
}

impl RetrievalConfig {
    #[must_use]
    pub fn retriever_config(&self) -> RetrieverConfig {
        RetrieverConfig {
            top_k: self.top_k,
            overfetch: self.overfetch.max(1),
            min_score: self.min_score,
            recency_weight: self.recency_weight,
            recency_half_life: Duration::from_secs(self.recency_half_life_hours * 3600),
            pinned_boost: self.pinned_boost,
            dedupe_similarity: self.dedupe_similarity,
            min_chunk_chars: self.min_chunk_chars,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatConfig {
    pub max_history: usize,
    pub max_prompt_tokens: usize,
    /// Tokens kept free for the answer.
    pub reserve_tokens: usize,
    pub system_prompt: String,
    pub event_buffer: usize,
    pub completion_retries: u32,
    pub unavailable_cooldown_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_history: 25,
            max_prompt_tokens: 4096,
            reserve_tokens: 1024,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            event_buffer: 64,
            completion_retries: 1,
            unavailable_cooldown_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub web_search_enabled: bool,
    pub web_search_max_results: usize,
    pub web_search_url: String,
    pub workspace_enabled: bool,
    pub workspace_max_chars: usize,
    pub timeout_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            web_search_enabled: false,
            web_search_max_results: 5,
            web_search_url: "https://html.duckduckgo.com/html/".into(),
            workspace_enabled: true,
            workspace_max_chars: 8000,
            timeout_secs: 10,
        }
    }
}

impl AgentsConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Workspace root used for indexing and `@path` lookups.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.index.root
    }
}
