use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::AsyncBufReadExt;

use quarry_core::agents::AgentRegistry;
use quarry_core::config::{Config, LlmConfig, ProviderKind};
use quarry_core::tool_call::ToolCall;
use quarry_core::{FinishReason, Orchestrator, OrchestratorConfig, TurnEvent, TurnStream};
use quarry_index::scanner::Scanner;
use quarry_index::watcher::IndexWatcher;
use quarry_index::{IndexingPipeline, Retriever, VectorIndex};
use quarry_llm::EmbeddingProvider;
use quarry_llm::any::AnyProvider;
#[cfg(feature = "mock")]
use quarry_llm::mock::MockProvider;
use quarry_llm::ollama::OllamaProvider;
use quarry_llm::provider::with_timeout;

const CLI_SESSION: &str = "cli";

type Engine = Orchestrator<AnyProvider, AnyProvider>;

#[derive(Parser)]
#[command(
    name = "quarry",
    version,
    about = "Ask questions about a local code and document corpus, answered by a local model"
)]
struct Cli {
    /// Path to the configuration file (TOML). A missing file means defaults.
    #[arg(long, global = true, env = "QUARRY_CONFIG", default_value = "quarry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring the index up to date with the workspace and exit.
    Index,
    /// Index, then keep following file changes until Ctrl-C.
    Watch,
    /// Answer a single question.
    Ask {
        /// The question. Prefix with `/refactor` to skip retrieval.
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
    /// Interactive session. `/reset` clears history, `/quit` exits, Ctrl-C cancels an answer.
    Chat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_subscriber(matches!(cli.command, Command::Chat));

    let config = Config::load(&cli.config)?;
    let provider = Arc::new(create_provider(&config.llm)?);

    match cli.command {
        Command::Index => run_index(&config, &provider).await,
        Command::Watch => run_watch(&config, &provider).await,
        Command::Ask { question } => run_ask(&config, &provider, &question.join(" ")).await,
        Command::Chat => run_chat(&config, &provider).await,
    }
}

/// Install the fmt subscriber. Interactive chat logs to `quarry.log` so output is not interleaved.
fn init_subscriber(to_file: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if to_file {
        match std::fs::File::create("quarry.log") {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(file)
                    .with_ansi(false)
                    .init();
            }
            Err(_) => tracing_subscriber::fmt().with_env_filter(filter).init(),
        }
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn create_provider(config: &LlmConfig) -> anyhow::Result<AnyProvider> {
    match config.provider {
        ProviderKind::Ollama => Ok(AnyProvider::Ollama(OllamaProvider::new(
            &config.base_url,
            config.model.clone(),
            config.embedding_model.clone(),
        ))),
        #[cfg(feature = "mock")]
        ProviderKind::Mock => Ok(AnyProvider::Mock(MockProvider::default())),
        #[cfg(not(feature = "mock"))]
        ProviderKind::Mock => bail!("the mock provider requires building with `--features mock`"),
    }
}

async fn health_check(provider: &AnyProvider) {
    match provider.health_check().await {
        Ok(()) => tracing::info!(provider = EmbeddingProvider::name(provider), "provider reachable"),
        Err(e) => tracing::warn!("provider health check failed: {e}"),
    }
}

/// Embed a probe string to learn the embedding dimension the index must use.
async fn probe_dimension(provider: &AnyProvider, limit: Duration) -> anyhow::Result<usize> {
    let vector = with_timeout(limit, provider.embed("dimension probe"))
        .await
        .context("failed to reach the embedding model")?;
    if vector.is_empty() {
        bail!("embedding model returned an empty vector");
    }
    Ok(vector.len())
}

async fn open_index(config: &Config, provider: &AnyProvider) -> anyhow::Result<Arc<VectorIndex>> {
    let dimension =
        probe_dimension(provider, Duration::from_secs(config.llm.embedding_timeout_secs)).await?;
    let path = config.index.resolved_db_path();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let (index, recreated) = VectorIndex::open_or_recreate(&path, dimension, provider.model_tag())
        .await
        .with_context(|| format!("failed to open index at {}", path.display()))?;
    if recreated {
        tracing::warn!(path = %path.display(), "index was unreadable and has been recreated");
    }
    tracing::info!(
        path = %path.display(),
        dimension,
        chunks = index.len(),
        "index opened"
    );
    Ok(Arc::new(index))
}

fn start_pipeline(
    config: &Config,
    index: &Arc<VectorIndex>,
    provider: &Arc<AnyProvider>,
) -> Arc<IndexingPipeline<AnyProvider>> {
    let scanner = Scanner::new(config.root(), config.index.scan_config());
    let pipeline_config = config
        .index
        .pipeline_config(Duration::from_secs(config.llm.embedding_timeout_secs));
    Arc::new(IndexingPipeline::start(
        Arc::clone(index),
        Arc::clone(provider),
        scanner,
        pipeline_config,
    ))
}

async fn run_index(config: &Config, provider: &Arc<AnyProvider>) -> anyhow::Result<()> {
    let index = open_index(config, provider).await?;
    let pipeline = start_pipeline(config, &index, provider);

    let queued = pipeline.reconcile().await.context("full scan failed")?;
    pipeline.wait_idle().await;
    let stats = pipeline.stats();
    pipeline.shutdown().await;

    println!(
        "scanned {queued} paths: {} indexed, {} unchanged, {} removed, {} failed ({} retries), {} chunks total",
        stats.indexed,
        stats.skipped,
        stats.removed,
        stats.failed,
        stats.retried,
        index.len()
    );
    index.close().await;
    Ok(())
}

async fn run_watch(config: &Config, provider: &Arc<AnyProvider>) -> anyhow::Result<()> {
    let index = open_index(config, provider).await?;
    let pipeline = start_pipeline(config, &index, provider);
    pipeline.reconcile().await.context("full scan failed")?;
    let _watcher = IndexWatcher::start(Arc::clone(&pipeline), config.index.debounce())
        .context("failed to start file watcher")?;
    tracing::info!(root = %config.root().display(), "watching for changes, Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("received shutdown signal");
    pipeline.shutdown().await;
    index.close().await;
    Ok(())
}

/// Everything a conversational command keeps alive.
struct Runtime {
    engine: Engine,
    index: Arc<VectorIndex>,
    pipeline: Arc<IndexingPipeline<AnyProvider>>,
    _watcher: Option<IndexWatcher>,
}

impl Runtime {
    /// Open the index, start background indexing, and build the orchestrator.
    ///
    /// With `wait_for_scan` the index is brought up to date before the first question.
    async fn start(
        config: &Config,
        provider: &Arc<AnyProvider>,
        wait_for_scan: bool,
        watch: bool,
    ) -> anyhow::Result<Self> {
        health_check(provider).await;
        let index = open_index(config, provider).await?;
        let pipeline = start_pipeline(config, &index, provider);

        catch_up(&pipeline, config.index.rescan_after(), wait_for_scan).await?;

        let watcher = if watch {
            match IndexWatcher::start(Arc::clone(&pipeline), config.index.debounce()) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!("file watcher unavailable, index will not follow edits: {e}");
                    None
                }
            }
        } else {
            None
        };

        let retriever = config.retrieval.enabled.then(|| {
            Arc::new(Retriever::new(
                Arc::clone(&index),
                Arc::clone(provider),
                config.retrieval.retriever_config(),
            ))
        });
        let agents = AgentRegistry::from_config(&config.agents, config.root());
        let engine = Orchestrator::new(
            Arc::clone(provider),
            retriever,
            agents,
            OrchestratorConfig::from(config),
        );

        Ok(Self {
            engine,
            index,
            pipeline,
            _watcher: watcher,
        })
    }

    async fn stop(self) {
        self.engine.shutdown();
        self.pipeline.shutdown().await;
        self.index.close().await;
    }
}

/// Reconcile a reopened index with the workspace, picking up edits made while quarry was not
/// running. Unchanged documents are skipped after hashing. Blocks until indexing is idle when
/// `wait` is set, or when the index is empty or its periodic full scan is due.
async fn catch_up<E: EmbeddingProvider + 'static>(
    pipeline: &IndexingPipeline<E>,
    rescan_after: Duration,
    wait: bool,
) -> anyhow::Result<()> {
    let index = pipeline.index();
    let scan_due = index.is_empty() || index.needs_full_scan(rescan_after).await.unwrap_or(true);
    let queued = pipeline.reconcile().await.context("workspace scan failed")?;
    tracing::debug!(queued, scan_due, "startup reconcile queued");
    if wait || scan_due {
        pipeline.wait_idle().await;
    }
    Ok(())
}

async fn run_ask(config: &Config, provider: &Arc<AnyProvider>, question: &str) -> anyhow::Result<()> {
    let runtime = Runtime::start(config, provider, true, false).await?;
    let result = match runtime.engine.submit_turn(CLI_SESSION, question) {
        Ok(stream) => print_answer(&runtime.engine, stream).await,
        Err(e) => Err(e.into()),
    };
    runtime.stop().await;
    result
}

async fn run_chat(config: &Config, provider: &Arc<AnyProvider>) -> anyhow::Result<()> {
    let runtime = Runtime::start(config, provider, false, config.index.watch).await?;
    let engine = &runtime.engine;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    println!("quarry chat: /reset clears the conversation, /quit exits, Ctrl-C stops an answer");
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                engine.reset_session(CLI_SESSION);
                println!("conversation cleared");
                continue;
            }
            _ => {}
        }

        match engine.submit_turn(CLI_SESSION, input) {
            Ok(stream) => {
                if let Err(e) = print_answer(engine, stream).await {
                    eprintln!("error: {e:#}");
                }
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    runtime.stop().await;
    Ok(())
}

/// Relay a turn to stdout. Ctrl-C cancels the turn; the partial answer stays on screen.
async fn print_answer(engine: &Engine, mut stream: TurnStream) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c() => {
                engine.cancel(CLI_SESSION).await;
                continue;
            }
        };
        let Some(event) = event else {
            return Ok(());
        };
        match event {
            TurnEvent::Context { sources } => {
                if !sources.is_empty() {
                    eprintln!("[context: {}]", sources.join(", "));
                }
            }
            TurnEvent::Delta(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            TurnEvent::Done(summary) => {
                writeln!(stdout)?;
                if summary.finish == FinishReason::Cancelled {
                    eprintln!("[answer cancelled]");
                }
                if let Some(k) = summary.context_reduced_from {
                    eprintln!(
                        "[context reduced from {k} to {} chunks to fit the prompt]",
                        summary.context_chunks
                    );
                }
                for detected in &summary.tool_calls {
                    match &detected.call {
                        ToolCall::CreateFile { path, content } => eprintln!(
                            "[tool call {}: {path} ({} chars), not executed]",
                            detected.call.name(),
                            content.chars().count()
                        ),
                    }
                }
                return Ok(());
            }
            TurnEvent::Error(e) => {
                writeln!(stdout)?;
                return Err(e.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use quarry_index::PipelineConfig;
    use quarry_index::scanner::ScanConfig;
    use quarry_llm::mock::MockProvider;

    use super::*;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    async fn reopen(
        db: &Path,
        root: &Path,
        provider: &Arc<MockProvider>,
    ) -> (Arc<VectorIndex>, IndexingPipeline<MockProvider>) {
        let index = Arc::new(
            VectorIndex::open(db, provider.dimension, &provider.model_tag)
                .await
                .unwrap(),
        );
        let pipeline = IndexingPipeline::start(
            Arc::clone(&index),
            Arc::clone(provider),
            Scanner::new(root, ScanConfig::default()),
            PipelineConfig {
                debounce: Duration::from_millis(10),
                ..PipelineConfig::default()
            },
        );
        (index, pipeline)
    }

    fn indexed_text(index: &VectorIndex, id: &str) -> String {
        index
            .chunks_of(id)
            .iter()
            .map(|c| c.meta.text.as_str())
            .collect()
    }

    #[test]
    fn cli_parses_ask_question_words() {
        let cli = Cli::try_parse_from(["quarry", "ask", "what", "is", "foo?"]).unwrap();
        match cli.command {
            Command::Ask { question } => assert_eq!(question.join(" "), "what is foo?"),
            _ => panic!("expected ask"),
        }
        assert_eq!(cli.config, PathBuf::from("quarry.toml"));
    }

    #[test]
    fn cli_config_flag_is_global() {
        let cli = Cli::try_parse_from(["quarry", "index", "--config", "custom.toml"]).unwrap();
        assert!(matches!(cli.command, Command::Index));
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
    }

    #[test]
    fn ask_requires_a_question() {
        assert!(Cli::try_parse_from(["quarry", "ask"]).is_err());
    }

    #[test]
    fn ollama_provider_from_default_config() {
        let provider = create_provider(&LlmConfig::default()).unwrap();
        assert!(matches!(provider, AnyProvider::Ollama(_)));
    }

    #[tokio::test]
    async fn reopened_index_sees_offline_edits() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("index.db");
        let root = dir.path().join("workspace");
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn old_name() -> u32 {\n    1\n}\n").unwrap();
        std::fs::write(root.join("src/notes.md"), "Release notes for the first version.").unwrap();
        let provider = Arc::new(MockProvider::default());

        let (index, pipeline) = reopen(&db, &root, &provider).await;
        catch_up(&pipeline, WEEK, false).await.unwrap();
        assert!(indexed_text(&index, "src/lib.rs").contains("old_name"));
        assert!(index.document("src/notes.md").is_some());
        pipeline.shutdown().await;
        index.close().await;

        std::fs::write(root.join("src/lib.rs"), "pub fn new_name() -> u32 {\n    2\n}\n").unwrap();
        std::fs::remove_file(root.join("src/notes.md")).unwrap();

        let (index, pipeline) = reopen(&db, &root, &provider).await;
        assert!(!index.needs_full_scan(WEEK).await.unwrap());
        catch_up(&pipeline, WEEK, true).await.unwrap();

        let text = indexed_text(&index, "src/lib.rs");
        assert!(text.contains("new_name"));
        assert!(!text.contains("old_name"));
        assert!(index.document("src/notes.md").is_none());
        pipeline.shutdown().await;
        index.close().await;
    }

    #[cfg(feature = "mock")]
    #[tokio::test]
    async fn mock_dimension_probe() {
        let provider = AnyProvider::Mock(MockProvider::default().with_dimension(16));
        let dim = probe_dimension(&provider, Duration::from_secs(1)).await.unwrap();
        assert_eq!(dim, 16);
    }
}
