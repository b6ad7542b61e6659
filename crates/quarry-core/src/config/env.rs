use std::path::PathBuf;

use super::Config;

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_llm();
        self.apply_env_overrides_index();
        self.apply_env_overrides_chat();
    }

    fn apply_env_overrides_llm(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_LLM_PROVIDER") {
            if let Ok(kind) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.llm.provider = kind;
            } else {
                tracing::warn!("ignoring invalid QUARRY_LLM_PROVIDER value: {v}");
            }
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_COMPLETION_TIMEOUT_SECS")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.llm.completion_timeout_secs = secs;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_EMBEDDING_TIMEOUT_SECS")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.llm.embedding_timeout_secs = secs;
        }
    }

    fn apply_env_overrides_index(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_INDEX_ROOT") {
            self.index.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("QUARRY_INDEX_SOURCES") {
            self.index.sources = v;
        }
        if let Ok(v) = std::env::var("QUARRY_INDEX_DB_PATH") {
            self.index.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("QUARRY_INDEX_MAX_FILES")
            && let Ok(n) = v.parse::<usize>()
        {
            self.index.max_files = n;
        }
        if let Ok(v) = std::env::var("QUARRY_INDEX_WORKERS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.index.workers = n;
        }
        if let Ok(v) = std::env::var("QUARRY_INDEX_DEBOUNCE_MS")
            && let Ok(ms) = v.parse::<u64>()
        {
            self.index.debounce_ms = ms;
        }
        if let Ok(v) = std::env::var("QUARRY_INDEX_MAX_RETRIES")
            && let Ok(n) = v.parse::<u32>()
        {
            self.index.max_retries = n;
        }
        if let Ok(v) = std::env::var("QUARRY_INDEX_WATCH")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.index.watch = enabled;
        }
    }

    fn apply_env_overrides_chat(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_RETRIEVAL_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.retrieval.enabled = enabled;
        }
        if let Ok(v) = std::env::var("QUARRY_RETRIEVAL_TOP_K")
            && let Ok(k) = v.parse::<usize>()
        {
            self.retrieval.top_k = k;
        }
        if let Ok(v) = std::env::var("QUARRY_RETRIEVAL_MIN_SCORE")
            && let Ok(score) = v.parse::<f32>()
        {
            self.retrieval.min_score = score;
        }
        if let Ok(v) = std::env::var("QUARRY_CHAT_MAX_HISTORY")
            && let Ok(n) = v.parse::<usize>()
        {
            self.chat.max_history = n;
        }
        if let Ok(v) = std::env::var("QUARRY_CHAT_MAX_PROMPT_TOKENS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.chat.max_prompt_tokens = n;
        }
        if let Ok(v) = std::env::var("QUARRY_AGENTS_WEB_SEARCH_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.agents.web_search_enabled = enabled;
        }
        if let Ok(v) = std::env::var("QUARRY_AGENTS_WORKSPACE_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.agents.workspace_enabled = enabled;
        }
    }
}
