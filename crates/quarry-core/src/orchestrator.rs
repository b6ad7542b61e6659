//! Conversation orchestration.
//!
//! Each session runs at most one turn at a time. A turn appends the user message, gathers
//! retrieved context and agent results, assembles a budgeted prompt, and relays the
//! completion to the consumer as a stream of [`TurnEvent`]s. Different sessions run
//! independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use quarry_index::{RetrievalContext, Retriever, SessionContext};
use quarry_llm::provider::{CompletionOptions, Message, Role};
use quarry_llm::retry::Backoff;
use quarry_llm::{CompletionProvider, EmbeddingProvider};

use crate::agents::{AgentKind, AgentOutput, AgentRegistry, AgentRequest, route};
use crate::config::Config;
use crate::error::{OrchestratorError, TurnError};
use crate::health::ProviderHealth;
use crate::prompt::{Prompt, PromptBudget, PromptInput, assemble, estimate_tokens};
use crate::session::{HistoryEntry, Session, TurnState};
use crate::tool_call::{self, DetectedToolCall};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub system_prompt: String,
    pub budget: PromptBudget,
    pub max_history: usize,
    /// Chunks requested from the retriever per turn.
    pub top_k: usize,
    pub event_buffer: usize,
    /// Extra completion attempts allowed while nothing has been streamed yet.
    pub completion_retries: u32,
    pub retry_backoff: Backoff,
    pub first_token_timeout: Duration,
    pub completion_timeout: Duration,
    pub unavailable_cooldown: Duration,
    pub options: CompletionOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            system_prompt: config.chat.system_prompt.clone(),
            budget: PromptBudget {
                max_tokens: config.chat.max_prompt_tokens,
                reserve_tokens: config.chat.reserve_tokens,
            },
            max_history: config.chat.max_history,
            top_k: config.retrieval.top_k,
            event_buffer: config.chat.event_buffer,
            completion_retries: config.chat.completion_retries,
            retry_backoff: Backoff {
                base: Duration::from_millis(500),
                max: Duration::from_secs(5),
            },
            first_token_timeout: Duration::from_secs(config.llm.first_token_timeout_secs),
            completion_timeout: Duration::from_secs(config.llm.completion_timeout_secs),
            unavailable_cooldown: Duration::from_secs(config.chat.unavailable_cooldown_secs),
            options: config.llm.completion_options(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub text: String,
    /// Skip retrieval regardless of routing.
    pub context_free: bool,
}

impl TurnRequest {
    #[must_use]
    pub fn context_free(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context_free: true,
        }
    }
}

impl From<&str> for TurnRequest {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_owned(),
            context_free: false,
        }
    }
}

impl From<String> for TurnRequest {
    fn from(text: String) -> Self {
        Self {
            text,
            context_free: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Complete,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnSummary {
    pub finish: FinishReason,
    /// Everything streamed during the turn.
    pub text: String,
    pub context_chunks: usize,
    /// Set when the retrieved context was reduced to fit the prompt.
    pub context_reduced_from: Option<usize>,
    pub history_dropped: usize,
    /// Agents whose results were folded into the prompt.
    pub agents: Vec<AgentKind>,
    /// Tool calls found in the answer, for the host to execute.
    pub tool_calls: Vec<DetectedToolCall>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Documents the prompt's retrieved context came from, sent before the first delta.
    Context { sources: Vec<String> },
    Delta(String),
    Done(TurnSummary),
    Error(TurnError),
}

pub type TurnStream = ReceiverStream<TurnEvent>;

struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
    /// Fired once the turn has released the session.
    settled: CancellationToken,
}

struct SessionSlot {
    session: tokio::sync::Mutex<Session>,
    active: Mutex<Option<ActiveTurn>>,
    state: Mutex<TurnState>,
}

impl SessionSlot {
    fn new(id: &str, max_history: usize) -> Self {
        Self {
            session: tokio::sync::Mutex::new(Session::new(id, max_history)),
            active: Mutex::new(None),
            state: Mutex::new(TurnState::Idle),
        }
    }

    fn transition(&self, session: &mut Session, to: TurnState) {
        session.transition(to);
        self.mirror(session);
    }

    fn mirror(&self, session: &Session) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = session.state();
    }
}

enum Outcome {
    Done(TurnSummary),
    Failed(TurnError),
}

enum StreamEnd {
    Finished,
    Cancelled,
    Failed(TurnError),
}

pub struct Orchestrator<P, E>
where
    P: CompletionProvider + 'static,
    E: EmbeddingProvider + 'static,
{
    inner: Arc<Inner<P, E>>,
}

impl<P, E> Clone for Orchestrator<P, E>
where
    P: CompletionProvider + 'static,
    E: EmbeddingProvider + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<P, E>
where
    P: CompletionProvider + 'static,
    E: EmbeddingProvider + 'static,
{
    provider: Arc<P>,
    retriever: Option<Arc<Retriever<E>>>,
    agents: AgentRegistry,
    config: OrchestratorConfig,
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
    health: ProviderHealth,
    shutdown: CancellationToken,
    next_turn: AtomicU64,
}

impl<P, E> Orchestrator<P, E>
where
    P: CompletionProvider + 'static,
    E: EmbeddingProvider + 'static,
{
    /// `retriever` is `None` when retrieval is disabled; every turn is then context-free.
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        retriever: Option<Arc<Retriever<E>>>,
        agents: AgentRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let health = ProviderHealth::new(config.unavailable_cooldown);
        Self {
            inner: Arc::new(Inner {
                provider,
                retriever,
                agents,
                config,
                sessions: Mutex::new(HashMap::new()),
                health,
                shutdown: CancellationToken::new(),
                next_turn: AtomicU64::new(1),
            }),
        }
    }

    /// Start a turn on `session_id`, creating the session on first use.
    ///
    /// The returned stream yields an optional `Context` event, zero or more `Delta`s, and ends
    /// with exactly one `Done` or `Error`. Dropping the stream cancels the turn.
    ///
    /// # Errors
    ///
    /// Fails fast with [`OrchestratorError::SessionBusy`] while the session has an active turn,
    /// [`OrchestratorError::ProviderUnavailable`] during the provider cooldown, and
    /// [`OrchestratorError::Shutdown`] after [`Self::shutdown`].
    pub fn submit_turn(
        &self,
        session_id: &str,
        request: impl Into<TurnRequest>,
    ) -> Result<TurnStream, OrchestratorError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::Shutdown);
        }
        let request = request.into();
        let slot = inner.slot(session_id);
        let cancel = inner.shutdown.child_token();
        let settled = CancellationToken::new();
        let turn_id = inner.next_turn.fetch_add(1, Ordering::Relaxed);

        {
            let mut active = slot.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.is_some() {
                return Err(OrchestratorError::SessionBusy(session_id.to_owned()));
            }
            if let Err(retry_in) = inner.health.admit() {
                return Err(OrchestratorError::ProviderUnavailable { retry_in });
            }
            *active = Some(ActiveTurn {
                id: turn_id,
                cancel: cancel.clone(),
                settled: settled.clone(),
            });
        }

        let (tx, rx) = mpsc::channel(inner.config.event_buffer.max(1));
        tokio::spawn(Arc::clone(inner).run_turn(slot, turn_id, request, tx, cancel, settled));
        Ok(ReceiverStream::new(rx))
    }

    /// Cancel the session's active turn and wait until the session is idle again, so the next
    /// [`Self::submit_turn`] is accepted. Returns `false` if nothing was running.
    ///
    /// The turn's stream still receives its final `Done` event; it does not need to be drained
    /// for this to return.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let Some(slot) = self.inner.existing_slot(session_id) else {
            return false;
        };
        let settled = {
            let active = slot.active.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(turn) = active.as_ref() else {
                return false;
            };
            tracing::debug!(session = session_id, turn = turn.id, "cancelling turn");
            turn.cancel.cancel();
            turn.settled.clone()
        };
        settled.cancelled().await;
        true
    }

    /// Discard the session and its history, cancelling any active turn.
    /// Returns `false` if the session did not exist.
    pub fn reset_session(&self, session_id: &str) -> bool {
        let removed = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        let Some(slot) = removed else {
            return false;
        };
        if let Some(turn) = slot
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            turn.cancel.cancel();
        }
        tracing::info!(session = session_id, "session reset");
        true
    }

    #[must_use]
    pub fn is_busy(&self, session_id: &str) -> bool {
        self.inner.existing_slot(session_id).is_some_and(|slot| {
            slot.active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
        })
    }

    #[must_use]
    pub fn session_state(&self, session_id: &str) -> Option<TurnState> {
        let slot = self.inner.existing_slot(session_id)?;
        let state = *slot.state.lock().unwrap_or_else(PoisonError::into_inner);
        Some(state)
    }

    /// Snapshot of the session history. Waits for an active turn to finish.
    pub async fn history(&self, session_id: &str) -> Vec<HistoryEntry> {
        let Some(slot) = self.inner.existing_slot(session_id) else {
            return Vec::new();
        };
        let session = slot.session.lock().await;
        session.history().iter().cloned().collect()
    }

    /// Retrieved context of the session's last turn.
    pub async fn last_context(&self, session_id: &str) -> RetrievalContext {
        let Some(slot) = self.inner.existing_slot(session_id) else {
            return RetrievalContext::default();
        };
        slot.session.lock().await.last_context.clone()
    }

    /// Pinned, excluded and path-restricted documents for the session's future retrievals.
    pub async fn set_retrieval_scope(&self, session_id: &str, scope: SessionContext) {
        let slot = self.inner.slot(session_id);
        slot.session.lock().await.retrieval = scope;
    }

    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Cancel every active turn and refuse new ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl<P, E> Inner<P, E>
where
    P: CompletionProvider + 'static,
    E: EmbeddingProvider + 'static,
{
    fn slot(&self, session_id: &str) -> Arc<SessionSlot> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(sessions.entry(session_id.to_owned()).or_insert_with(|| {
            tracing::debug!(session = session_id, "session created");
            Arc::new(SessionSlot::new(session_id, self.config.max_history))
        }))
    }

    fn existing_slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    async fn run_turn(
        self: Arc<Self>,
        slot: Arc<SessionSlot>,
        turn_id: u64,
        request: TurnRequest,
        tx: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
        settled: CancellationToken,
    ) {
        let settle = settled.drop_guard();
        let outcome = {
            let mut session = slot.session.lock().await;
            let outcome = self.drive(&slot, &mut session, request, &tx, &cancel).await;
            session.settle();
            slot.mirror(&session);
            outcome
        };

        {
            let mut active = slot.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.as_ref().is_some_and(|turn| turn.id == turn_id) {
                *active = None;
            }
        }
        // Before the final send, which may wait on a consumer that is itself awaiting `cancel`.
        drop(settle);

        let event = match outcome {
            Outcome::Done(summary) => TurnEvent::Done(summary),
            Outcome::Failed(e) => TurnEvent::Error(e),
        };
        let _ = tx.send(event).await;
    }

    async fn drive(
        &self,
        slot: &SessionSlot,
        session: &mut Session,
        request: TurnRequest,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let route = route(&request.text);
        let context_free = request.context_free || route.context_free;
        session.push(Role::User, request.text.as_str(), false);
        slot.transition(session, TurnState::AwaitingRetrieval);
        tracing::debug!(
            session = %session.id,
            context_free,
            agents = route.agents.len(),
            "turn started"
        );

        let scope = session.retrieval.clone();
        let gather = async {
            let context = if context_free {
                RetrievalContext::default()
            } else {
                self.retrieve(&route.query, &scope).await
            };
            let outputs = if route.agents.is_empty() {
                Vec::new()
            } else {
                let agent_request = AgentRequest {
                    query: route.query.clone(),
                    mentions: route.mentions.clone(),
                };
                self.agents.dispatch(&route.agents, &agent_request).await
            };
            (context, outputs)
        };
        let (context, outputs) = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return self.cancelled(slot, session, String::new(), None, Vec::new());
            }
            () = tx.closed() => {
                return self.cancelled(slot, session, String::new(), None, Vec::new());
            }
            gathered = gather => gathered,
        };
        let agents: Vec<AgentKind> = outputs.iter().map(|o| o.kind).collect();

        slot.transition(session, TurnState::AwaitingCompletion);
        let prompt = self.build_prompt(session, &route.query, &context, &outputs);
        session.last_context = prompt.context.clone();

        let sources = unique_sources(&prompt.context);
        if tx.send(TurnEvent::Context { sources }).await.is_err() {
            return self.cancelled(slot, session, String::new(), Some(&prompt), agents);
        }

        let mut text = String::new();
        let mut attempt = 0;
        let end = loop {
            match self
                .stream_once(slot, session, &prompt.messages, tx, cancel, &mut text)
                .await
            {
                StreamEnd::Failed(e)
                    if text.is_empty()
                        && e.is_transient()
                        && attempt < self.config.completion_retries =>
                {
                    let delay = self.config.retry_backoff.delay(attempt);
                    attempt += 1;
                    tracing::warn!(
                        session = %session.id,
                        attempt,
                        "{e}, retrying completion in {}ms",
                        delay.as_millis()
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break StreamEnd::Cancelled,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                end => break end,
            }
        };

        session.tokens_used += prompt.tokens + estimate_tokens(&text);
        match end {
            StreamEnd::Finished => {
                self.health.record_success();
                let tool_calls = tool_call::detect(&text);
                session.push(Role::Assistant, text.as_str(), false);
                slot.transition(session, TurnState::Idle);
                tracing::info!(
                    session = %session.id,
                    context_chunks = prompt.context.len(),
                    chars = text.len(),
                    tool_calls = tool_calls.len(),
                    "turn completed"
                );
                let mut done = summary(FinishReason::Complete, text, Some(&prompt), agents);
                done.tool_calls = tool_calls;
                Outcome::Done(done)
            }
            StreamEnd::Cancelled => self.cancelled(slot, session, text, Some(&prompt), agents),
            StreamEnd::Failed(e) => {
                if !text.is_empty() {
                    session.push(Role::Assistant, text.as_str(), true);
                }
                match &e {
                    TurnError::ProviderUnavailable(_) => {
                        self.health.record_unavailable();
                        slot.transition(session, TurnState::Failed);
                    }
                    TurnError::ProviderTimeout(_) => {
                        self.health.release_probe();
                        slot.transition(session, TurnState::Idle);
                    }
                    TurnError::ContentRejected(_) | TurnError::Provider(_) => {
                        self.health.record_success();
                        slot.transition(session, TurnState::Idle);
                    }
                }
                tracing::warn!(session = %session.id, partial = !text.is_empty(), "turn failed: {e}");
                Outcome::Failed(e)
            }
        }
    }

    async fn retrieve(&self, query: &str, scope: &SessionContext) -> RetrievalContext {
        let Some(retriever) = &self.retriever else {
            return RetrievalContext::default();
        };
        match retriever.retrieve(query, scope, self.config.top_k).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!("retrieval failed, answering without context: {e}");
                RetrievalContext::default()
            }
        }
    }

    fn build_prompt(
        &self,
        session: &Session,
        query: &str,
        context: &RetrievalContext,
        outputs: &[AgentOutput],
    ) -> Prompt {
        let history = session.prior_history();
        let prompt = assemble(
            &PromptInput {
                system: &self.config.system_prompt,
                history: &history,
                context,
                agent_outputs: outputs,
                query,
            },
            self.config.budget,
        );
        if let Some(requested) = prompt.context_reduced_from() {
            tracing::warn!(
                session = %session.id,
                requested,
                kept = prompt.context.len(),
                "prompt budget reduced retrieved context"
            );
        }
        prompt
    }

    /// One completion attempt. Appends every delivered fragment to `text`.
    async fn stream_once(
        &self,
        slot: &SessionSlot,
        session: &mut Session,
        messages: &[Message],
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
        text: &mut String,
    ) -> StreamEnd {
        let started = Instant::now();
        let deadline = started + self.config.completion_timeout;
        let first_deadline = (started + self.config.first_token_timeout).min(deadline);
        let first_timeout = first_deadline - started;

        let call = self.provider.complete(messages, &self.config.options);
        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return StreamEnd::Cancelled,
            () = tx.closed() => return StreamEnd::Cancelled,
            result = tokio::time::timeout_at(first_deadline, call) => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return StreamEnd::Failed(e.into()),
                Err(_) => return StreamEnd::Failed(TurnError::ProviderTimeout(first_timeout)),
            },
        };

        let mut received = false;
        loop {
            let until = if received { deadline } else { first_deadline };
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return StreamEnd::Cancelled,
                () = tx.closed() => return StreamEnd::Cancelled,
                next = tokio::time::timeout_at(until, stream.next()) => next,
            };
            let fragment = match next {
                Err(_) => {
                    let limit = if received {
                        self.config.completion_timeout
                    } else {
                        first_timeout
                    };
                    return StreamEnd::Failed(TurnError::ProviderTimeout(limit));
                }
                Ok(None) => return StreamEnd::Finished,
                Ok(Some(Err(e))) => return StreamEnd::Failed(e.into()),
                Ok(Some(Ok(fragment))) => fragment,
            };
            if fragment.is_empty() {
                continue;
            }
            if !received {
                received = true;
                slot.transition(session, TurnState::Streaming);
            }
            text.push_str(&fragment);
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => false,
                sent = tx.send(TurnEvent::Delta(fragment)) => sent.is_ok(),
            };
            if !sent {
                return StreamEnd::Cancelled;
            }
        }
    }

    fn cancelled(
        &self,
        slot: &SessionSlot,
        session: &mut Session,
        text: String,
        prompt: Option<&Prompt>,
        agents: Vec<AgentKind>,
    ) -> Outcome {
        if text.is_empty() {
            self.health.release_probe();
        } else {
            self.health.record_success();
            session.push(Role::Assistant, text.as_str(), true);
        }
        slot.transition(session, TurnState::Cancelled);
        slot.transition(session, TurnState::Idle);
        tracing::info!(session = %session.id, partial_chars = text.len(), "turn cancelled");
        Outcome::Done(summary(FinishReason::Cancelled, text, prompt, agents))
    }
}

fn summary(
    finish: FinishReason,
    text: String,
    prompt: Option<&Prompt>,
    agents: Vec<AgentKind>,
) -> TurnSummary {
    TurnSummary {
        finish,
        text,
        context_chunks: prompt.map_or(0, |p| p.context.len()),
        context_reduced_from: prompt.and_then(Prompt::context_reduced_from),
        history_dropped: prompt.map_or(0, |p| p.history_dropped),
        agents,
        tool_calls: Vec::new(),
    }
}

fn unique_sources(context: &RetrievalContext) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for chunk in &context.chunks {
        if !sources.iter().any(|s| s == chunk.document()) {
            sources.push(chunk.document().to_owned());
        }
    }
    sources
}
