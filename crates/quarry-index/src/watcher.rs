use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use tokio::sync::mpsc;

use quarry_llm::EmbeddingProvider;

use crate::error::Result;
use crate::index::VectorIndex;
use crate::pipeline::IndexingPipeline;
use crate::queue::{ChangeKind, FileEvent};
use crate::scanner::Scanner;

/// Forwards filesystem notifications under the scanner root to an [`IndexingPipeline`].
/// Watching stops when the value is dropped.
pub struct IndexWatcher {
    handle: tokio::task::JoinHandle<()>,
}

impl IndexWatcher {
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be initialized.
    pub fn start<E: EmbeddingProvider + 'static>(
        pipeline: Arc<IndexingPipeline<E>>,
        debounce: Duration,
    ) -> Result<Self> {
        let root = pipeline.scanner().root().to_path_buf();
        let canonical_root = root.canonicalize().unwrap_or_else(|_| root.clone());
        let (notify_tx, mut notify_rx) = mpsc::channel::<PathBuf>(256);

        let mut debouncer = new_debouncer(
            debounce,
            move |events: std::result::Result<
                Vec<notify_debouncer_mini::DebouncedEvent>,
                notify::Error,
            >| {
                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("index watcher error: {e}");
                        return;
                    }
                };

                let paths: HashSet<PathBuf> = events
                    .into_iter()
                    .filter(|e| matches!(e.kind, DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous))
                    .map(|e| e.path)
                    .collect();

                for path in paths {
                    let _ = notify_tx.blocking_send(path);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&root, notify::RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), "watching for file changes");

        let handle = tokio::spawn(async move {
            let _debouncer = debouncer;
            while let Some(path) = notify_rx.recv().await {
                let path = rebase(&path, &canonical_root, &root);
                let Some(event) = event_for(pipeline.scanner(), pipeline.index(), &path) else {
                    continue;
                };
                if let Err(e) = pipeline.submit(event).await {
                    tracing::warn!(path = %path.display(), "could not queue file event: {e}");
                    break;
                }
            }
        });

        Ok(Self { handle })
    }
}

impl Drop for IndexWatcher {
    fn drop(&mut self) {
        // The task owns the debouncer; aborting it stops the OS watch.
        self.handle.abort();
    }
}

/// Map a path reported under the canonical root back under the configured root.
fn rebase(path: &Path, canonical_root: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(canonical_root)
        .map_or_else(|_| path.to_path_buf(), |rel| root.join(rel))
}

/// Translate a changed path into a pipeline event: existing files become additions or
/// modifications, missing ones removals. Untracked paths yield `None`.
#[must_use]
pub fn event_for(scanner: &Scanner, index: &VectorIndex, path: &Path) -> Option<FileEvent> {
    let id = scanner.document_id(path)?;
    let known = index.document(&id).is_some();

    let kind = if path.is_file() {
        if !scanner.is_tracked(&id) {
            return None;
        }
        if known {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        }
    } else if path.exists() || !known {
        return None;
    } else {
        ChangeKind::Removed
    };
    Some(FileEvent::new(id, kind))
}
