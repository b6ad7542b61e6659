use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use quarry_core::agents::AgentRegistry;
use quarry_core::config::Config;
use quarry_core::{
    FinishReason, Orchestrator, OrchestratorConfig, TurnEvent, TurnRequest, TurnState,
};
use quarry_index::scanner::{ScanConfig, Scanner};
use quarry_index::{
    IndexingPipeline, PipelineConfig, RetrievalConfig, Retriever, SessionContext, VectorIndex,
};
use quarry_llm::mock::MockProvider;

const LIB_RS: &str = "pub fn answer_to_everything() -> u32 {\n    42\n}\n";

// -- Fixture --

struct Workspace {
    dir: tempfile::TempDir,
    provider: Arc<MockProvider>,
    index: Arc<VectorIndex>,
    pipeline: IndexingPipeline<MockProvider>,
}

impl Workspace {
    async fn new(provider: MockProvider) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(provider);
        let index = Arc::new(
            VectorIndex::open_in_memory(provider.dimension, &provider.model_tag)
                .await
                .unwrap(),
        );
        let scanner = Scanner::new(dir.path(), ScanConfig::default());
        let pipeline = IndexingPipeline::start(
            Arc::clone(&index),
            Arc::clone(&provider),
            scanner,
            PipelineConfig {
                debounce: Duration::from_millis(20),
                workers: 2,
                ..PipelineConfig::default()
            },
        );
        Self {
            dir,
            provider,
            index,
            pipeline,
        }
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    async fn index_all(&self) {
        self.pipeline.reconcile().await.unwrap();
        self.pipeline.wait_idle().await;
    }

    fn orchestrator(&self, completions: &MockProvider) -> Orchestrator<MockProvider, MockProvider> {
        let retriever = Retriever::new(
            Arc::clone(&self.index),
            Arc::clone(&self.provider),
            RetrievalConfig {
                min_chunk_chars: 10,
                ..RetrievalConfig::default()
            },
        );
        Orchestrator::new(
            Arc::new(completions.clone()),
            Some(Arc::new(retriever)),
            AgentRegistry::from_config(&Config::default().agents, self.root()),
            OrchestratorConfig {
                first_token_timeout: Duration::from_secs(5),
                completion_timeout: Duration::from_secs(10),
                ..OrchestratorConfig::default()
            },
        )
    }
}

async fn collect(stream: quarry_core::TurnStream) -> Vec<TurnEvent> {
    stream.collect().await
}

fn answer_text(events: &[TurnEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Delta(d) => Some(d.as_str()),
            _ => None,
        })
        .collect()
}

// -- Tests --

#[tokio::test]
async fn empty_index_answers_without_context() {
    let ws = Workspace::new(MockProvider::default()).await;
    let completions = MockProvider::with_responses(vec!["I have no context for that.".into()]);
    let orch = ws.orchestrator(&completions);

    let events = collect(orch.submit_turn("s", "What does function foo do?").unwrap()).await;

    assert_eq!(events[0], TurnEvent::Context { sources: vec![] });
    assert_eq!(answer_text(&events), "I have no context for that.");
    assert!(matches!(events.last(), Some(TurnEvent::Done(s)) if s.finish == FinishReason::Complete));

    let system = &completions.prompts()[0][0].content;
    assert!(!system.contains("<retrieved_context>"));
    assert_eq!(orch.session_state("s"), Some(TurnState::Idle));
}

#[tokio::test]
async fn indexed_file_reaches_the_prompt() {
    let ws = Workspace::new(MockProvider::default()).await;
    ws.write("src/lib.rs", LIB_RS);
    ws.index_all().await;
    assert!(!ws.index.is_empty());

    let completions = MockProvider::with_responses(vec!["It returns 42.".into()]);
    let orch = ws.orchestrator(&completions);

    let events = collect(
        orch.submit_turn("s", "pub fn answer to everything u32 42")
            .unwrap(),
    )
    .await;

    assert_eq!(
        events[0],
        TurnEvent::Context {
            sources: vec!["src/lib.rs".to_owned()]
        }
    );
    let system = &completions.prompts()[0][0].content;
    assert!(system.contains("<retrieved_context>"));
    assert!(system.contains("source=\"src/lib.rs\""));
    assert!(system.contains("answer_to_everything"));

    match events.last() {
        Some(TurnEvent::Done(summary)) => {
            assert_eq!(summary.text, "It returns 42.");
            assert_eq!(summary.context_chunks, 1);
        }
        other => panic!("expected Done, got {other:?}"),
    }
    assert_eq!(orch.last_context("s").await.len(), 1);
}

#[tokio::test]
async fn removed_file_leaves_the_context() {
    let ws = Workspace::new(MockProvider::default()).await;
    ws.write("src/lib.rs", LIB_RS);
    ws.index_all().await;

    std::fs::remove_file(ws.root().join("src/lib.rs")).unwrap();
    ws.index_all().await;
    assert!(ws.index.is_empty());

    let completions = MockProvider::default();
    let orch = ws.orchestrator(&completions);
    collect(orch.submit_turn("s", "pub fn answer to everything u32 42").unwrap()).await;
    assert!(!completions.prompts()[0][0].content.contains("<retrieved_context>"));
}

#[tokio::test]
async fn refactor_turn_skips_retrieval() {
    let ws = Workspace::new(MockProvider::default()).await;
    ws.write("src/lib.rs", LIB_RS);
    ws.index_all().await;
    let embeds_before = ws.provider.embed_calls();

    let completions = MockProvider::default();
    let orch = ws.orchestrator(&completions);
    let events = collect(
        orch.submit_turn("s", "/refactor pub fn answer to everything u32 42")
            .unwrap(),
    )
    .await;

    assert_eq!(events[0], TurnEvent::Context { sources: vec![] });
    assert_eq!(ws.provider.embed_calls(), embeds_before);
    let prompt = &completions.prompts()[0];
    assert!(!prompt[0].content.contains("<retrieved_context>"));
    assert_eq!(
        prompt.last().unwrap().content,
        "pub fn answer to everything u32 42"
    );
}

#[tokio::test]
async fn embedding_outage_degrades_to_no_context() {
    let ws = Workspace::new(MockProvider::default()).await;
    ws.write("src/lib.rs", LIB_RS);
    ws.index_all().await;
    ws.provider.fail_next_embeds(1);

    let completions = MockProvider::default();
    let orch = ws.orchestrator(&completions);
    let events = collect(orch.submit_turn("s", "pub fn answer to everything u32 42").unwrap()).await;

    assert_eq!(events[0], TurnEvent::Context { sources: vec![] });
    assert!(matches!(events.last(), Some(TurnEvent::Done(_))));
}

#[tokio::test]
async fn cancel_then_resubmit_on_same_session() {
    let ws = Workspace::new(MockProvider::default()).await;
    let completions = MockProvider::with_responses(vec![
        "a b c d e f g h i j k l m n o p".into(),
        "second answer".into(),
    ])
    .with_chunk_delay(25);
    let orch = ws.orchestrator(&completions);

    let mut stream = orch.submit_turn("s", "spell it out").unwrap();
    while let Some(event) = stream.next().await {
        if matches!(event, TurnEvent::Delta(_)) {
            break;
        }
    }
    assert!(orch.cancel("s").await);

    let next = orch.submit_turn("s", "try again").unwrap();
    let events = collect(next).await;
    assert_eq!(answer_text(&events), "second answer");

    let rest: Vec<TurnEvent> = stream.collect().await;
    assert!(matches!(
        rest.last(),
        Some(TurnEvent::Done(s)) if s.finish == FinishReason::Cancelled
    ));

    let history = orch.history("s").await;
    assert_eq!(history.len(), 4);
    assert!(history[1].incomplete);
    assert!(!history[3].incomplete);
}

#[tokio::test]
async fn sessions_run_concurrently() {
    let ws = Workspace::new(MockProvider::default()).await;
    let completions = MockProvider::default().with_chunk_delay(20);
    let orch = ws.orchestrator(&completions);

    let a = orch.submit_turn("a", "first").unwrap();
    let b = orch.submit_turn("b", "second").unwrap();
    assert!(orch.is_busy("a") && orch.is_busy("b"));

    let (ea, eb) = tokio::join!(collect(a), collect(b));
    assert_eq!(answer_text(&ea), "mock response");
    assert_eq!(answer_text(&eb), "mock response");
    assert_eq!(orch.session_ids(), vec!["a".to_owned(), "b".to_owned()]);
}

#[tokio::test]
async fn workspace_mention_is_read_from_disk() {
    let ws = Workspace::new(MockProvider::default()).await;
    ws.write("docs/notes.md", "The deploy script lives in ops/deploy.sh.");

    let completions = MockProvider::default();
    let orch = ws.orchestrator(&completions);
    collect(orch.submit_turn("s", "summarise @docs/notes.md").unwrap()).await;

    let system = &completions.prompts()[0][0].content;
    assert!(system.contains("<agent_result agent=\"workspace_file\">"));
    assert!(system.contains("ops/deploy.sh"));
}

#[tokio::test]
async fn explicit_context_free_request_skips_retrieval() {
    let ws = Workspace::new(MockProvider::default()).await;
    ws.write("src/lib.rs", LIB_RS);
    ws.index_all().await;
    let embeds_before = ws.provider.embed_calls();

    let completions = MockProvider::default();
    let orch = ws.orchestrator(&completions);
    let request = TurnRequest::context_free("pub fn answer to everything u32 42");
    collect(orch.submit_turn("s", request).unwrap()).await;

    assert_eq!(ws.provider.embed_calls(), embeds_before);
    assert!(orch.last_context("s").await.is_empty());
}

#[tokio::test]
async fn excluded_documents_stay_out_of_the_prompt() {
    let ws = Workspace::new(MockProvider::default()).await;
    ws.write("src/lib.rs", LIB_RS);
    ws.index_all().await;

    let completions = MockProvider::default();
    let orch = ws.orchestrator(&completions);
    orch.set_retrieval_scope(
        "s",
        SessionContext {
            exclude: ["src/lib.rs".to_owned()].into_iter().collect(),
            ..SessionContext::default()
        },
    )
    .await;

    let events = collect(orch.submit_turn("s", "pub fn answer to everything u32 42").unwrap()).await;
    assert_eq!(events[0], TurnEvent::Context { sources: vec![] });
    assert!(!completions.prompts()[0][0].content.contains("answer_to_everything"));
}
