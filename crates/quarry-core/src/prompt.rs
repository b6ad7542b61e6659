//! Budgeted prompt assembly.
//!
//! Priority when the budget is tight: system prompt and query always go in (an oversized
//! query is cut to fit), then retrieved context (shrinking `k` rather than dropping it
//! silently), then agent results, then history from newest to oldest.

use std::borrow::Cow;

use quarry_index::RetrievalContext;
use quarry_index::retriever::format_as_context;
use quarry_llm::provider::{Message, Role};

use crate::agents::{AgentOutput, format_agent_outputs};
use crate::session::HistoryEntry;

/// Fixed cost charged per message for role markers and separators.
const MESSAGE_OVERHEAD: usize = 4;

/// Rough token estimate: four characters per token.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptBudget {
    pub max_tokens: usize,
    /// Kept free for the answer.
    pub reserve_tokens: usize,
}

impl PromptBudget {
    #[must_use]
    pub fn available(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserve_tokens)
    }
}

pub struct PromptInput<'a> {
    pub system: &'a str,
    pub history: &'a [HistoryEntry],
    pub context: &'a RetrievalContext,
    pub agent_outputs: &'a [AgentOutput],
    pub query: &'a str,
}

#[derive(Debug, Clone)]
pub struct Prompt {
    pub messages: Vec<Message>,
    pub tokens: usize,
    /// Chunks that made it into the prompt.
    pub context: RetrievalContext,
    /// Number of retrieved chunks before budget reduction.
    pub context_requested: usize,
    pub history_used: usize,
    pub history_dropped: usize,
}

impl Prompt {
    /// `Some(k)` when retrieved context had to be reduced to fit.
    #[must_use]
    pub fn context_reduced_from(&self) -> Option<usize> {
        (self.context.len() < self.context_requested).then_some(self.context_requested)
    }
}

#[must_use]
pub fn assemble(input: &PromptInput<'_>, budget: PromptBudget) -> Prompt {
    let available = budget.available();
    let fixed = estimate_tokens(input.system) + 2 * MESSAGE_OVERHEAD;
    let query = clamp_tokens(input.query, available.saturating_sub(fixed));
    if query.len() < input.query.len() {
        tracing::warn!(
            query_tokens = estimate_tokens(input.query),
            kept_tokens = estimate_tokens(&query),
            "query exceeds the prompt budget and was truncated"
        );
    }
    let mut used = fixed + estimate_tokens(&query);

    let requested = input.context.len();
    let mut k = requested;
    let mut context_block = format_as_context(input.context);
    while k > 0 && used + estimate_tokens(&context_block) > available {
        k -= 1;
        context_block = format_as_context(&input.context.truncated(k));
    }
    if k < requested {
        tracing::debug!(requested, kept = k, "reduced retrieved context to fit the prompt budget");
    }
    used += estimate_tokens(&context_block);

    let mut agents_block = format_agent_outputs(input.agent_outputs);
    let agents_cost = estimate_tokens(&agents_block);
    if used + agents_cost > available {
        let room_chars = available.saturating_sub(used) * 4;
        agents_block = agents_block.chars().take(room_chars).collect();
        if agents_block.is_empty() {
            tracing::warn!("no room left for agent results in the prompt");
        }
    }
    used += estimate_tokens(&agents_block);

    let mut kept = Vec::new();
    for entry in input.history.iter().rev() {
        let content = history_content(entry);
        let cost = estimate_tokens(&content) + MESSAGE_OVERHEAD;
        if used + cost > available {
            break;
        }
        used += cost;
        kept.push(Message {
            role: entry.role,
            content,
        });
    }
    kept.reverse();
    let history_used = kept.len();
    let history_dropped = input.history.len() - history_used;

    let mut system = input.system.to_owned();
    for block in [&context_block, &agents_block] {
        if !block.is_empty() {
            system.push_str("\n\n");
            system.push_str(block);
        }
    }

    let mut messages = Vec::with_capacity(kept.len() + 2);
    messages.push(Message::system(system));
    messages.extend(kept);
    messages.push(Message::user(query));

    Prompt {
        messages,
        tokens: used,
        context: input.context.truncated(k),
        context_requested: requested,
        history_used,
        history_dropped,
    }
}

/// Longest prefix of `text` whose estimate fits in `max_tokens`.
fn clamp_tokens(text: &str, max_tokens: usize) -> Cow<'_, str> {
    if estimate_tokens(text) <= max_tokens {
        return Cow::Borrowed(text);
    }
    match text.char_indices().nth(max_tokens * 4) {
        Some((end, _)) => Cow::Borrowed(&text[..end]),
        None => Cow::Borrowed(text),
    }
}

fn history_content(entry: &HistoryEntry) -> String {
    if entry.incomplete && entry.role == Role::Assistant {
        format!("{}\n(answer interrupted)", entry.content)
    } else {
        entry.content.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use proptest::prelude::*;
    use quarry_index::index::{ChunkId, ChunkMeta, StoredChunk};
    use quarry_index::retriever::RetrievedChunk;

    use super::*;
    use crate::agents::AgentKind;

    fn entry(role: Role, content: &str) -> HistoryEntry {
        HistoryEntry {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            incomplete: false,
        }
    }

    fn context(n: usize, text_len: usize) -> RetrievalContext {
        RetrievalContext {
            chunks: (0..n)
                .map(|i| RetrievedChunk {
                    chunk: Arc::new(StoredChunk::new(
                        ChunkId::new(format!("src/f{i}.rs"), 0),
                        ChunkMeta {
                            start: 0,
                            end: text_len,
                            line_start: 1,
                            line_end: 10,
                            text: "x".repeat(text_len),
                        },
                        vec![1.0],
                        1,
                        "m",
                        i as u64,
                    )),
                    similarity: 0.9,
                    score: 0.9,
                })
                .collect(),
        }
    }

    fn budget(max_tokens: usize) -> PromptBudget {
        PromptBudget {
            max_tokens,
            reserve_tokens: 0,
        }
    }

    #[test]
    fn layout_is_system_history_query() {
        let history = [entry(Role::User, "hi"), entry(Role::Assistant, "hello")];
        let ctx = context(1, 40);
        let prompt = assemble(
            &PromptInput {
                system: "be brief",
                history: &history,
                context: &ctx,
                agent_outputs: &[],
                query: "what is f0?",
            },
            budget(4096),
        );
        assert_eq!(prompt.messages.len(), 4);
        assert_eq!(prompt.messages[0].role, Role::System);
        assert!(prompt.messages[0].content.starts_with("be brief\n\n<retrieved_context>"));
        assert_eq!(prompt.messages[1].content, "hi");
        assert_eq!(prompt.messages[3], Message::user("what is f0?"));
        assert_eq!(prompt.history_dropped, 0);
        assert_eq!(prompt.context_reduced_from(), None);
    }

    #[test]
    fn oversized_query_is_cut_to_the_budget() {
        let query = "q".repeat(2000);
        let prompt = assemble(
            &PromptInput {
                system: "sys",
                history: &[entry(Role::User, "earlier")],
                context: &context(2, 200),
                agent_outputs: &[],
                query: &query,
            },
            PromptBudget {
                max_tokens: 100,
                reserve_tokens: 20,
            },
        );
        let sent = &prompt.messages.last().unwrap().content;
        assert!(query.starts_with(sent.as_str()));
        assert_eq!(estimate_tokens(sent), 80 - 2 * MESSAGE_OVERHEAD);
        assert!(prompt.tokens <= 80);
        assert!(prompt.context.is_empty());
        assert_eq!(prompt.history_used, 0);
    }

    #[test]
    fn query_within_budget_is_untouched() {
        assert!(matches!(clamp_tokens("short", 10), Cow::Borrowed("short")));
        assert_eq!(clamp_tokens("héllo wörld", 1), "héll");
    }

    #[test]
    fn empty_context_adds_no_block() {
        let prompt = assemble(
            &PromptInput {
                system: "sys",
                history: &[],
                context: &RetrievalContext::default(),
                agent_outputs: &[],
                query: "q",
            },
            budget(4096),
        );
        assert_eq!(prompt.messages[0].content, "sys");
        assert!(prompt.context.is_empty());
    }

    #[test]
    fn oldest_history_dropped_before_context() {
        let history: Vec<HistoryEntry> = (0..10)
            .map(|i| entry(Role::User, &format!("{i}{}", "h".repeat(199))))
            .collect();
        let ctx = context(2, 200);
        let prompt = assemble(
            &PromptInput {
                system: "",
                history: &history,
                context: &ctx,
                agent_outputs: &[],
                query: "q",
            },
            budget(400),
        );
        assert_eq!(prompt.context.len(), 2);
        assert!(prompt.history_dropped > 0);
        assert!(prompt.history_used > 0);
        let first_kept = &prompt.messages[1].content;
        let expected_first = format!("{}", 10 - prompt.history_used);
        assert!(first_kept.starts_with(&expected_first));
        assert!(prompt.tokens <= 400);
    }

    #[test]
    fn context_shrinks_instead_of_vanishing() {
        let ctx = context(4, 800);
        let prompt = assemble(
            &PromptInput {
                system: "",
                history: &[],
                context: &ctx,
                agent_outputs: &[],
                query: "q",
            },
            budget(500),
        );
        assert_eq!(prompt.context.len(), 2);
        assert_eq!(prompt.context_reduced_from(), Some(4));
        assert!(prompt.messages[0].content.contains("src/f1.rs"));
        assert!(!prompt.messages[0].content.contains("src/f2.rs"));
    }

    #[test]
    fn agent_results_are_included() {
        let outputs = [AgentOutput {
            kind: AgentKind::WorkspaceFile,
            content: "File: a.rs".into(),
        }];
        let prompt = assemble(
            &PromptInput {
                system: "sys",
                history: &[],
                context: &RetrievalContext::default(),
                agent_outputs: &outputs,
                query: "q",
            },
            budget(4096),
        );
        assert!(prompt.messages[0].content.contains("<agent_result agent=\"workspace_file\">"));
    }

    #[test]
    fn interrupted_answers_are_marked() {
        let mut partial = entry(Role::Assistant, "The function");
        partial.incomplete = true;
        let prompt = assemble(
            &PromptInput {
                system: "",
                history: &[partial],
                context: &RetrievalContext::default(),
                agent_outputs: &[],
                query: "go on",
            },
            budget(4096),
        );
        assert_eq!(prompt.messages[1].content, "The function\n(answer interrupted)");
    }

    proptest! {
        #[test]
        fn history_fills_newest_first(sizes in proptest::collection::vec(1usize..400, 0..30), max in 50usize..2000) {
            let history: Vec<HistoryEntry> = sizes
                .iter()
                .map(|&n| entry(Role::User, &"a".repeat(n)))
                .collect();
            let prompt = assemble(
                &PromptInput {
                    system: "s",
                    history: &history,
                    context: &RetrievalContext::default(),
                    agent_outputs: &[],
                    query: "q",
                },
                budget(max),
            );
            prop_assert_eq!(prompt.history_used + prompt.history_dropped, history.len());
            prop_assert!(prompt.tokens <= max.max(2 * MESSAGE_OVERHEAD));
            let kept = &prompt.messages[1..prompt.messages.len() - 1];
            let tail = &history[history.len() - prompt.history_used..];
            for (m, h) in kept.iter().zip(tail) {
                prop_assert_eq!(&m.content, &h.content);
            }
        }
    }
}
