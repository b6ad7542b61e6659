use std::sync::LazyLock;

use regex::Regex;

use super::AgentKind;

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)@([A-Za-z0-9_][A-Za-z0-9_./\-]*)").unwrap());

const WEB_PHRASES: [&str; 4] = [
    "search the web",
    "search online",
    "look it up online",
    "search the internet",
];

/// How a turn should be handled, derived from the user's text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Route {
    /// Skip retrieval for this turn.
    pub context_free: bool,
    /// Agents to run, in order.
    pub agents: Vec<AgentKind>,
    /// The text with command markers removed.
    pub query: String,
    pub mentions: Vec<String>,
}

/// Classify a turn by its intent markers: a leading `/refactor` is context-free, `/web` or a
/// "search the web" phrase asks for a web search, and `@path` mentions load workspace files.
#[must_use]
pub fn route(text: &str) -> Route {
    let mut query = text.trim();
    let mut context_free = false;
    let mut agents = Vec::new();

    loop {
        if let Some(rest) = strip_command(query, "/refactor") {
            context_free = true;
            query = rest;
        } else if let Some(rest) = strip_command(query, "/web") {
            if !agents.contains(&AgentKind::WebSearch) {
                agents.push(AgentKind::WebSearch);
            }
            query = rest;
        } else {
            break;
        }
    }

    let lower = query.to_lowercase();
    if WEB_PHRASES.iter().any(|p| lower.contains(p)) && !agents.contains(&AgentKind::WebSearch) {
        agents.push(AgentKind::WebSearch);
    }

    let mut mentions: Vec<String> = Vec::new();
    for caps in MENTION_RE.captures_iter(query) {
        if let Some(m) = caps.get(1) {
            let path = m.as_str().trim_end_matches(['.', ',', ':', ';', '!', '?']);
            if !path.is_empty() && !mentions.iter().any(|p| p == path) {
                mentions.push(path.to_owned());
            }
        }
    }
    if !mentions.is_empty() {
        agents.push(AgentKind::WorkspaceFile);
    }

    Route {
        context_free,
        agents,
        query: query.to_owned(),
        mentions,
    }
}

fn strip_command<'a>(text: &'a str, command: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(command)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim_start())
    } else {
        None
    }
}
