//! Detection of bracket-style tool calls in model answers, for models without native
//! function calling: `[CALL CreateFile('path', 'content')]`.
//!
//! Calls are only detected and reported; executing them is up to the host.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Characters of an answer scanned for calls. Anything beyond is ignored.
pub const MAX_SCAN_CHARS: usize = 50_000;

static CALL_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[CALL\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    CreateFile { path: String, content: String },
}

impl ToolCall {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateFile { .. } => "CreateFile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedToolCall {
    pub call: ToolCall,
    /// The bracketed text the call was parsed from.
    pub original_text: String,
}

/// Find every recognised call in `text`, in order of appearance.
#[must_use]
pub fn detect(text: &str) -> Vec<DetectedToolCall> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let text = match text.char_indices().nth(MAX_SCAN_CHARS) {
        Some((cut, _)) => &text[..cut],
        None => text,
    };

    let mut found = Vec::new();
    let mut from = 0;
    while let Some(caps) = CALL_START.captures_at(text, from) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        match parse_arguments(text, whole.end()) {
            Some((args, end)) => {
                if let Some(call) = build_call(name.as_str(), args) {
                    found.push(DetectedToolCall {
                        call,
                        original_text: text[whole.start()..end].to_owned(),
                    });
                } else {
                    tracing::debug!(tool = name.as_str(), "ignoring unsupported tool call");
                }
                from = end;
            }
            None => from = whole.end(),
        }
    }
    found
}

fn build_call(name: &str, mut args: Vec<String>) -> Option<ToolCall> {
    match name {
        "CreateFile" if args.len() == 2 => {
            let content = args.pop()?;
            let path = args.pop()?;
            if path.trim().is_empty() {
                return None;
            }
            Some(ToolCall::CreateFile { path, content })
        }
        _ => None,
    }
}

/// Parse quoted, comma-separated arguments starting right after the opening parenthesis.
/// Returns the arguments and the byte offset just past the closing `)]`.
fn parse_arguments(text: &str, start: usize) -> Option<(Vec<String>, usize)> {
    let mut chars = text[start..].char_indices().peekable();
    let mut args = Vec::new();

    loop {
        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        let (_, c) = chars.next()?;
        match c {
            ')' if args.is_empty() => break,
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                loop {
                    let (_, c) = chars.next()?;
                    match c {
                        '\\' => match chars.next()? {
                            (_, 'n') => value.push('\n'),
                            (_, 't') => value.push('\t'),
                            (_, other) => value.push(other),
                        },
                        c if c == quote => break,
                        c => value.push(c),
                    }
                }
                args.push(value);
            }
            _ => return None,
        }

        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        match chars.next()? {
            (_, ',') => {}
            (_, ')') => break,
            _ => return None,
        }
    }

    while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    let (offset, c) = chars.next()?;
    (c == ']').then_some((args, start + offset + 1))
}
