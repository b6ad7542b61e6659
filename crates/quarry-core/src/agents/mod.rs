//! Sub-agents a turn can dispatch to before the final completion.
//!
//! Agents are a closed set resolved through [`AgentRegistry`] by [`AgentKind`]. Routing is
//! explicit: intent markers in the user's text decide which agents run (see [`route`]).

mod routing;
pub mod web_search;
pub mod workspace;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AgentsConfig;
use crate::error::AgentError;

pub use routing::{Route, route};
pub use web_search::WebSearchAgent;
pub use workspace::WorkspaceAgent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    WebSearch,
    WorkspaceFile,
}

impl AgentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSearch => "web_search",
            Self::WorkspaceFile => "workspace_file",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input handed to an agent.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub query: String,
    /// Workspace-relative paths mentioned as `@path`.
    pub mentions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub kind: AgentKind,
    pub content: String,
}

#[derive(Debug, Clone)]
pub enum Agent {
    WebSearch(WebSearchAgent),
    WorkspaceFile(WorkspaceAgent),
}

impl Agent {
    #[must_use]
    pub fn kind(&self) -> AgentKind {
        match self {
            Self::WebSearch(_) => AgentKind::WebSearch,
            Self::WorkspaceFile(_) => AgentKind::WorkspaceFile,
        }
    }

    /// # Errors
    ///
    /// Returns the agent's own failure; callers treat it as "no result".
    pub async fn run(&self, request: &AgentRequest) -> Result<AgentOutput, AgentError> {
        let content = match self {
            Self::WebSearch(agent) => agent.run(&request.query).await?,
            Self::WorkspaceFile(agent) => agent.run(&request.mentions).await?,
        };
        Ok(AgentOutput {
            kind: self.kind(),
            content,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentKind, Agent>,
    timeout: Duration,
}

impl AgentRegistry {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            agents: HashMap::new(),
            timeout,
        }
    }

    /// Registry with the agents enabled in `config`; `root` anchors `@path` lookups.
    #[must_use]
    pub fn from_config(config: &AgentsConfig, root: &Path) -> Self {
        let mut registry = Self::new(config.timeout());
        if config.web_search_enabled {
            registry.register(Agent::WebSearch(WebSearchAgent::new(
                config.web_search_url.clone(),
                config.web_search_max_results,
                config.timeout(),
            )));
        }
        if config.workspace_enabled {
            registry.register(Agent::WorkspaceFile(WorkspaceAgent::new(
                root,
                config.workspace_max_chars,
            )));
        }
        registry
    }

    /// Add or replace the agent for its kind.
    pub fn register(&mut self, agent: Agent) {
        self.agents.insert(agent.kind(), agent);
    }

    #[must_use]
    pub fn get(&self, kind: AgentKind) -> Option<&Agent> {
        self.agents.get(&kind)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Run the requested agents in order. A missing, failing or timed-out agent is logged
    /// and left out of the result.
    pub async fn dispatch(&self, kinds: &[AgentKind], request: &AgentRequest) -> Vec<AgentOutput> {
        let mut outputs = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            let Some(agent) = self.get(kind) else {
                tracing::warn!(agent = %kind, "agent requested but not enabled, skipping");
                continue;
            };
            let result = if self.timeout.is_zero() {
                agent.run(request).await
            } else {
                tokio::time::timeout(self.timeout, agent.run(request))
                    .await
                    .unwrap_or(Err(AgentError::Timeout(self.timeout)))
            };
            match result {
                Ok(output) => outputs.push(output),
                Err(e) => tracing::warn!(agent = %kind, "agent failed, answering without it: {e}"),
            }
        }
        outputs
    }
}

/// Render agent results for inclusion in the prompt.
#[must_use]
pub fn format_agent_outputs(outputs: &[AgentOutput]) -> String {
    outputs
        .iter()
        .map(|o| format!("<agent_result agent=\"{}\">\n{}\n</agent_result>", o.kind, o.content))
        .collect::<Vec<_>>()
        .join("\n")
}
