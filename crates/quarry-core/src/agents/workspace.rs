use std::path::{Component, Path, PathBuf};

use crate::error::AgentError;

/// Reads files mentioned as `@path` in a turn, relative to the workspace root.
#[derive(Debug, Clone)]
pub struct WorkspaceAgent {
    root: PathBuf,
    max_chars: usize,
}

impl WorkspaceAgent {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, max_chars: usize) -> Self {
        Self {
            root: root.into(),
            max_chars,
        }
    }

    /// Load every mentioned file, sharing `max_chars` between them in mention order.
    /// Unreadable mentions are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if none of the mentions could be read.
    pub async fn run(&self, mentions: &[String]) -> Result<String, AgentError> {
        let mut out = String::new();
        let mut remaining = self.max_chars;
        let mut last_err = None;

        for mention in mentions {
            if remaining == 0 {
                break;
            }
            match self.read(mention).await {
                Ok(content) => {
                    let (body, truncated) = truncate_chars(&content, remaining);
                    remaining -= body.chars().count();
                    if !out.is_empty() {
                        out.push_str("\n\n");
                    }
                    out.push_str(&format!("File: {mention}\n```\n{body}\n```"));
                    if truncated {
                        out.push_str("\n(truncated)");
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %mention, "cannot read mentioned file: {e}");
                    last_err = Some(e);
                }
            }
        }

        match (out.is_empty(), last_err) {
            (true, Some(e)) => Err(e),
            (true, None) => Err(AgentError::Other("no readable files mentioned".into())),
            (false, _) => Ok(out),
        }
    }

    async fn read(&self, mention: &str) -> Result<String, AgentError> {
        let path = self.resolve(mention)?;
        let bytes = tokio::fs::read(&path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn resolve(&self, mention: &str) -> Result<PathBuf, AgentError> {
        let rel = Path::new(mention);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(AgentError::OutsideWorkspace(mention.to_owned()));
        }
        let path = self.root.join(rel);
        let canonical_root = self.root.canonicalize()?;
        let canonical = path.canonicalize()?;
        if !canonical.starts_with(&canonical_root) {
            return Err(AgentError::OutsideWorkspace(mention.to_owned()));
        }
        Ok(canonical)
    }
}

fn truncate_chars(text: &str, max: usize) -> (&str, bool) {
    match text.char_indices().nth(max) {
        Some((cut, _)) => (&text[..cut], true),
        None => (text, false),
    }
}
