//! Per-conversation state owned by the orchestrator.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use quarry_index::{RetrievalContext, SessionContext};
use quarry_llm::provider::Role;

/// Turn lifecycle of a session.
///
/// `Idle → AwaitingRetrieval → AwaitingCompletion → Streaming → Idle`. `Cancelled` is reachable
/// from every non-idle state and `Failed` from `AwaitingCompletion` and `Streaming`. Both settle
/// back to `Idle` (or start the next turn directly from `Failed` once the provider recovers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    AwaitingRetrieval,
    AwaitingCompletion,
    Streaming,
    Cancelled,
    Failed,
}

impl TurnState {
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        use TurnState::{AwaitingCompletion, AwaitingRetrieval, Cancelled, Failed, Idle, Streaming};
        matches!(
            (self, to),
            (Idle | Failed, AwaitingRetrieval)
                | (AwaitingRetrieval, AwaitingCompletion)
                | (AwaitingCompletion | Streaming, Idle | Failed)
                | (AwaitingCompletion, Streaming)
                | (AwaitingRetrieval | AwaitingCompletion | Streaming, Cancelled)
                | (Cancelled | Failed, Idle)
        )
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::AwaitingRetrieval | Self::AwaitingCompletion | Self::Streaming
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// The answer was cut short by cancellation or a mid-stream failure.
    pub incomplete: bool,
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    history: VecDeque<HistoryEntry>,
    max_history: usize,
    state: TurnState,
    pub last_context: RetrievalContext,
    pub retrieval: SessionContext,
    pub tokens_used: usize,
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<String>, max_history: usize) -> Self {
        Self {
            id: id.into(),
            history: VecDeque::new(),
            max_history: max_history.max(1),
            state: TurnState::Idle,
            last_context: RetrievalContext::default(),
            retrieval: SessionContext::default(),
            tokens_used: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Move to `to`, refusing transitions the state machine does not allow.
    ///
    /// Returns `false` and leaves the state unchanged on an invalid transition.
    pub fn transition(&mut self, to: TurnState) -> bool {
        if self.state.can_transition(to) {
            tracing::trace!(session = %self.id, from = ?self.state, ?to, "turn state");
            self.state = to;
            true
        } else {
            tracing::debug!(session = %self.id, from = ?self.state, ?to, "rejected turn transition");
            false
        }
    }

    /// Leave any active or cancelled state for `Idle`. `Failed` is kept until the next turn.
    pub(crate) fn settle(&mut self) {
        if self.state.is_active() {
            self.transition(TurnState::Cancelled);
        }
        if self.state == TurnState::Cancelled {
            self.transition(TurnState::Idle);
        }
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>, incomplete: bool) {
        self.history.push_back(HistoryEntry {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            incomplete,
        });
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    #[must_use]
    pub fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.history
    }

    /// History before the message currently being answered.
    #[must_use]
    pub fn prior_history(&self) -> Vec<HistoryEntry> {
        let n = self.history.len().saturating_sub(1);
        self.history.iter().take(n).cloned().collect()
    }
}
