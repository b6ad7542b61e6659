use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serial_test::serial;

use super::*;

const ENV_KEYS: [&str; 21] = [
    "QUARRY_LLM_PROVIDER",
    "QUARRY_LLM_BASE_URL",
    "QUARRY_LLM_MODEL",
    "QUARRY_LLM_EMBEDDING_MODEL",
    "QUARRY_LLM_COMPLETION_TIMEOUT_SECS",
    "QUARRY_LLM_EMBEDDING_TIMEOUT_SECS",
    "QUARRY_INDEX_ROOT",
    "QUARRY_INDEX_SOURCES",
    "QUARRY_INDEX_DB_PATH",
    "QUARRY_INDEX_MAX_FILES",
    "QUARRY_INDEX_WORKERS",
    "QUARRY_INDEX_DEBOUNCE_MS",
    "QUARRY_INDEX_MAX_RETRIES",
    "QUARRY_INDEX_WATCH",
    "QUARRY_RETRIEVAL_ENABLED",
    "QUARRY_RETRIEVAL_TOP_K",
    "QUARRY_RETRIEVAL_MIN_SCORE",
    "QUARRY_CHAT_MAX_HISTORY",
    "QUARRY_CHAT_MAX_PROMPT_TOKENS",
    "QUARRY_AGENTS_WEB_SEARCH_ENABLED",
    "QUARRY_AGENTS_WORKSPACE_ENABLED",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("quarry.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(f, "{body}").unwrap();
    path
}

#[test]
fn defaults_when_file_missing() {
    let config = Config::default();
    assert_eq!(config.llm.provider, ProviderKind::Ollama);
    assert_eq!(config.llm.base_url, "http://localhost:11434");
    assert_eq!(config.llm.model, "llama3.1");
    assert_eq!(config.llm.embedding_model, "nomic-embed-text");
    assert_eq!(config.index.sources, "src/");
    assert_eq!(config.index.max_files, 5000);
    assert_eq!(config.index.debounce_ms, 750);
    assert_eq!(config.index.max_retries, 3);
    assert_eq!(config.retrieval.top_k, 4);
    assert_eq!(config.chat.max_history, 25);
    assert!(!config.agents.web_search_enabled);
    assert!(config.agents.workspace_enabled);
}

#[test]
#[serial]
fn load_missing_file_uses_defaults() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.llm.model, "llama3.1");
    assert_eq!(config.index.workers, 4);
}

#[test]
#[serial]
fn parse_valid_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
[llm]
provider = "mock"
model = "qwen2.5-coder"

[index]
root = "/work/project"
sources = "src/;docs/"
debounce_ms = 200

[retrieval]
top_k = 8

[chat]
max_history = 10
"#,
    );

    clear_env();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.llm.provider, ProviderKind::Mock);
    assert_eq!(config.llm.model, "qwen2.5-coder");
    assert_eq!(config.llm.base_url, "http://localhost:11434");
    assert_eq!(config.index.root, PathBuf::from("/work/project"));
    assert_eq!(config.index.debounce(), Duration::from_millis(200));
    assert_eq!(config.index.workers, 4);
    assert_eq!(config.retrieval.top_k, 8);
    assert!((config.retrieval.min_score - 0.25).abs() < f32::EPSILON);
    assert_eq!(config.chat.max_history, 10);
    assert_eq!(config.chat.max_prompt_tokens, 4096);
}

#[test]
#[serial]
fn malformed_toml_is_an_error() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[llm\nmodel = ");
    let err = Config::load(&path).unwrap_err();
    assert!(err.to_string().contains("failed to parse config file"));
}

#[test]
#[serial]
fn env_overrides() {
    clear_env();
    let mut config = Config::default();
    unsafe { std::env::set_var("QUARRY_LLM_MODEL", "phi4") };
    unsafe { std::env::set_var("QUARRY_INDEX_SOURCES", "lib/") };
    unsafe { std::env::set_var("QUARRY_INDEX_WATCH", "false") };
    unsafe { std::env::set_var("QUARRY_RETRIEVAL_TOP_K", "2") };
    unsafe { std::env::set_var("QUARRY_AGENTS_WEB_SEARCH_ENABLED", "true") };
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.llm.model, "phi4");
    assert_eq!(config.index.sources, "lib/");
    assert!(!config.index.watch);
    assert_eq!(config.retrieval.top_k, 2);
    assert!(config.agents.web_search_enabled);
}

#[test]
#[serial]
fn env_override_invalid_values_ignored() {
    clear_env();
    let mut config = Config::default();
    unsafe { std::env::set_var("QUARRY_LLM_PROVIDER", "openai") };
    unsafe { std::env::set_var("QUARRY_INDEX_WORKERS", "many") };
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.llm.provider, ProviderKind::Ollama);
    assert_eq!(config.index.workers, 4);
}

#[test]
#[serial]
fn env_override_wins_over_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[index]\nmax_files = 10\n");
    clear_env();
    unsafe { std::env::set_var("QUARRY_INDEX_MAX_FILES", "20") };
    let config = Config::load(&path).unwrap();
    clear_env();

    assert_eq!(config.index.max_files, 20);
}

#[test]
#[serial]
fn invalid_chunk_overlap_rejected() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[index]\nchunk_max_size = 100\nchunk_overlap = 100\n");
    let err = Config::load(&path).unwrap_err();
    assert!(err.to_string().contains("chunk_overlap"));
}

#[test]
fn relative_db_path_resolves_against_root() {
    let mut index = IndexConfig {
        root: PathBuf::from("/work"),
        ..IndexConfig::default()
    };
    assert_eq!(index.resolved_db_path(), PathBuf::from("/work/.quarry/index.db"));

    index.db_path = PathBuf::from("/var/lib/quarry.db");
    assert_eq!(index.resolved_db_path(), PathBuf::from("/var/lib/quarry.db"));
}

#[test]
fn pipeline_config_carries_policy() {
    let index = IndexConfig {
        workers: 0,
        backoff_base_ms: 100,
        backoff_max_ms: 800,
        ..IndexConfig::default()
    };
    let pipeline = index.pipeline_config(Duration::from_secs(5));
    assert_eq!(pipeline.workers, 1);
    assert_eq!(pipeline.debounce, Duration::from_millis(750));
    assert_eq!(pipeline.backoff.base, Duration::from_millis(100));
    assert_eq!(pipeline.backoff.max, Duration::from_millis(800));
    assert_eq!(pipeline.embed_timeout, Duration::from_secs(5));
    assert_eq!(pipeline.chunker.max_size, 500);
    assert_eq!(pipeline.chunker.overlap, 50);
}

#[test]
fn scan_config_splits_sources() {
    let index = IndexConfig {
        sources: "src/;docs/".into(),
        ..IndexConfig::default()
    };
    assert_eq!(index.scan_config().sources, vec!["src/".to_owned(), "docs/".to_owned()]);
}

#[test]
fn retriever_config_converts_units() {
    let retrieval = RetrievalConfig::default().retriever_config();
    assert_eq!(retrieval.top_k, 4);
    assert_eq!(retrieval.recency_half_life, Duration::from_secs(72 * 3600));
    assert_eq!(retrieval.timeout, Duration::from_secs(10));
}

#[test]
fn provider_kind_display() {
    assert_eq!(ProviderKind::Ollama.to_string(), "ollama");
    assert_eq!(ProviderKind::Mock.as_str(), "mock");
}

#[test]
fn completion_options_follow_llm_section() {
    let llm = LlmConfig {
        temperature: 0.2,
        ..LlmConfig::default()
    };
    let options = llm.completion_options();
    assert!((options.temperature - 0.2).abs() < f32::EPSILON);
    assert_eq!(options.top_k, 50);
}
