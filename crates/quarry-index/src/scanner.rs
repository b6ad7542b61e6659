//! Source selection: which files under the workspace root are indexed.

use std::path::{Component, Path, PathBuf};

use crate::languages::is_source_file;

pub const DEFAULT_MAX_FILES: usize = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Include prefixes relative to the root. Empty means everything.
    pub sources: Vec<String>,
    pub max_files: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            sources: vec!["src/".into()],
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl ScanConfig {
    /// Parse a `;`-separated prefix list such as `"src/;docs/"`.
    #[must_use]
    pub fn from_sources(sources: &str, max_files: usize) -> Self {
        let sources = sources
            .split(';')
            .map(|s| s.trim().trim_start_matches("./").to_owned())
            .filter(|s| !s.is_empty() && s != ".")
            .collect();
        Self { sources, max_files }
    }
}

#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    config: ScanConfig,
}

impl Scanner {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, config: ScanConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Document id for a path: relative to the root, `/`-separated.
    /// `None` for paths outside the root.
    #[must_use]
    pub fn document_id(&self, path: &Path) -> Option<String> {
        let rel = if path.is_absolute() || path.starts_with(&self.root) {
            path.strip_prefix(&self.root).ok()?
        } else {
            path
        };
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    #[must_use]
    pub fn absolute(&self, document_id: &str) -> PathBuf {
        self.root.join(document_id)
    }

    /// Whether a document id falls under the configured sources and outside hidden directories.
    #[must_use]
    pub fn is_tracked(&self, document_id: &str) -> bool {
        if document_id.split('/').any(|part| part.starts_with('.')) {
            return false;
        }
        self.config.sources.is_empty()
            || self
                .config
                .sources
                .iter()
                .any(|prefix| document_id.starts_with(prefix.as_str()))
    }

    /// Walk the root and return the tracked files as document ids, source code first.
    ///
    /// Blocking; run it on a blocking thread from async code.
    #[must_use]
    pub fn scan(&self) -> Vec<String> {
        let mut files: Vec<(bool, String)> = ignore::WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .require_git(false)
            .build()
            .flatten()
            .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
            .filter(|e| e.metadata().is_ok_and(|m| m.len() > 0))
            .filter_map(|e| {
                let id = self.document_id(e.path())?;
                self.is_tracked(&id)
                    .then(|| (is_source_file(e.path()), id))
            })
            .collect();

        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        if files.len() > self.config.max_files {
            tracing::warn!(
                found = files.len(),
                max_files = self.config.max_files,
                "file limit reached, indexing only the first {}",
                self.config.max_files
            );
            files.truncate(self.config.max_files);
        }
        files.into_iter().map(|(_, id)| id).collect()
    }
}
