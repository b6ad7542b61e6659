//! Incremental indexing: file events → extract → chunk → embed → install generation.
//!
//! A fixed pool of workers drains the [`WorkQueue`]. Each job reconciles against the
//! file on disk, so events arriving out of order converge on the current state.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use quarry_llm::provider::{EmbeddingProvider, with_timeout};
use quarry_llm::retry::Backoff;
use quarry_llm::LlmError;

use crate::chunker::{ChunkerConfig, Span, blake3_hex, chunk, chunk_code, line_range};
use crate::error::{IndexError, Result};
use crate::extractor::{DEFAULT_MAX_FILE_BYTES, ExtractorSet};
use crate::index::{ChunkMeta, DocumentStatus, DocumentVersion, NewChunk, VectorIndex};
use crate::queue::{ChangeKind, FileEvent, Job, Pushed, WorkQueue};
use crate::scanner::Scanner;

const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chunker: ChunkerConfig,
    pub debounce: Duration,
    pub queue_capacity: usize,
    pub workers: usize,
    pub embed_batch_size: usize,
    /// Concurrent embedding calls across all workers.
    pub embed_concurrency: usize,
    pub embed_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Backoff,
    pub max_file_bytes: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            debounce: Duration::from_millis(750),
            queue_capacity: 1024,
            workers: 4,
            embed_batch_size: 10,
            embed_concurrency: 2,
            embed_timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff: Backoff::default(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

/// Cumulative job outcomes since the pipeline started.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub indexed: u64,
    pub skipped: u64,
    pub removed: u64,
    pub failed: u64,
    pub retried: u64,
}

#[derive(Debug, Default)]
struct Counters {
    indexed: AtomicU64,
    skipped: AtomicU64,
    removed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    processed: AtomicU64,
}

#[derive(Debug)]
enum Outcome {
    Indexed { chunks: usize, generation: u64 },
    Skipped,
    Removed { chunks: usize },
    /// Nothing on disk and nothing indexed.
    Absent,
}

struct Inner<E> {
    index: Arc<VectorIndex>,
    provider: Arc<E>,
    scanner: Scanner,
    extractors: ExtractorSet,
    queue: WorkQueue,
    config: PipelineConfig,
    embed_permits: Semaphore,
    counters: Counters,
}

pub struct IndexingPipeline<E: EmbeddingProvider + 'static> {
    inner: Arc<Inner<E>>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: EmbeddingProvider + 'static> IndexingPipeline<E> {
    /// Spawn the worker pool. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn start(
        index: Arc<VectorIndex>,
        provider: Arc<E>,
        scanner: Scanner,
        config: PipelineConfig,
    ) -> Self {
        let extractors = ExtractorSet::new(config.max_file_bytes);
        Self::with_extractors(index, provider, scanner, extractors, config)
    }

    #[must_use]
    pub fn with_extractors(
        index: Arc<VectorIndex>,
        provider: Arc<E>,
        scanner: Scanner,
        extractors: ExtractorSet,
        config: PipelineConfig,
    ) -> Self {
        if index.model_tag() != provider.model_tag() {
            tracing::warn!(
                index = index.model_tag(),
                provider = provider.model_tag(),
                "index was opened for a different embedding model"
            );
        }

        let workers = config.workers.max(1);
        let inner = Arc::new(Inner {
            queue: WorkQueue::new(config.queue_capacity, config.debounce),
            embed_permits: Semaphore::new(config.embed_concurrency.max(1)),
            index,
            provider,
            scanner,
            extractors,
            config,
            counters: Counters::default(),
        });
        let cancel = CancellationToken::new();
        let handles = (0..workers)
            .map(|worker| {
                let inner = Arc::clone(&inner);
                let cancel = cancel.clone();
                tokio::spawn(async move { run_worker(inner, worker, cancel).await })
            })
            .collect();
        tracing::debug!(workers, "indexing pipeline started");

        Self {
            inner,
            cancel,
            workers: Mutex::new(handles),
        }
    }

    #[must_use]
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.inner.index
    }

    #[must_use]
    pub fn scanner(&self) -> &Scanner {
        &self.inner.scanner
    }

    /// Queue a file event, waiting while the queue is full.
    ///
    /// Additions and modifications outside the tracked sources are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::QueueClosed`] after shutdown.
    pub async fn submit(&self, event: FileEvent) -> Result<Pushed> {
        if !self.accepts(&event) {
            return Ok(Pushed::Ignored);
        }
        self.inner.queue.push(event).await
    }

    /// Like [`submit`](Self::submit) but reports [`Pushed::Full`] instead of waiting.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::QueueClosed`] after shutdown.
    pub fn try_submit(&self, event: FileEvent) -> Result<Pushed> {
        if !self.accepts(&event) {
            return Ok(Pushed::Ignored);
        }
        self.inner.queue.try_push(event)
    }

    fn accepts(&self, event: &FileEvent) -> bool {
        event.kind == ChangeKind::Removed || self.inner.scanner.is_tracked(&event.document)
    }

    /// Full scan: queue every tracked file and a removal for every indexed document
    /// that is no longer on disk. Returns the number of events queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or the scan time cannot be recorded.
    pub async fn reconcile(&self) -> Result<usize> {
        let scanner = self.inner.scanner.clone();
        let files = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|e| IndexError::Other(format!("scan task failed: {e}")))?;
        let on_disk: HashSet<&str> = files.iter().map(String::as_str).collect();

        let mut queued = 0usize;
        for record in self.inner.index.documents() {
            if !on_disk.contains(record.id.as_str()) {
                self.inner
                    .queue
                    .push(FileEvent::new(record.id, ChangeKind::Removed))
                    .await?;
                queued += 1;
            }
        }
        for id in &files {
            let kind = if self.inner.index.document(id).is_some() {
                ChangeKind::Modified
            } else {
                ChangeKind::Added
            };
            self.inner.queue.push(FileEvent::new(id.clone(), kind)).await?;
            queued += 1;
        }

        self.inner.index.record_full_scan().await?;
        tracing::info!(files = files.len(), queued, "full scan queued");
        Ok(queued)
    }

    /// Resolve once every queued and in-flight job has finished.
    pub async fn wait_idle(&self) {
        self.inner.queue.wait_idle().await;
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        let c = &self.inner.counters;
        PipelineStats {
            indexed: c.indexed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            removed: c.removed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
        }
    }

    /// Stop the workers. Jobs still queued are dropped; an interrupted job leaves the
    /// document's previous generation in place.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.inner.queue.close();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl<E: EmbeddingProvider + 'static> Drop for IndexingPipeline<E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker<E: EmbeddingProvider + 'static>(
    inner: Arc<Inner<E>>,
    worker: usize,
    cancel: CancellationToken,
) {
    while let Some(job) = inner.queue.next(&cancel).await {
        let result = tokio::select! {
            r = inner.process(&job) => r,
            () = cancel.cancelled() => {
                inner.queue.complete(&job.document);
                break;
            }
        };

        match result {
            Ok(outcome) => {
                inner.record(&job.document, outcome);
                inner.queue.complete(&job.document);
            }
            Err(e) if e.is_retryable() && job.attempt < inner.config.max_retries => {
                let delay = inner.config.backoff.delay(job.attempt);
                tracing::warn!(
                    document = %job.document,
                    attempt = job.attempt + 1,
                    max_retries = inner.config.max_retries,
                    "indexing failed: {e}, retrying in {}ms",
                    delay.as_millis()
                );
                inner.counters.retried.fetch_add(1, Ordering::Relaxed);
                inner.queue.retry(job, delay);
                continue;
            }
            Err(e) => {
                tracing::warn!(document = %job.document, "indexing failed, marking document: {e}");
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                if let Err(mark) = inner.index.mark_failed(&job.document, &e.to_string()).await {
                    tracing::warn!(document = %job.document, "could not mark document failed: {mark}");
                }
                inner.queue.complete(&job.document);
            }
        }

        let processed = inner.counters.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if processed % PROGRESS_EVERY == 0 {
            tracing::info!(processed, queued = inner.queue.len(), "indexing progress");
        }
    }
    tracing::trace!(worker, "indexing worker stopped");
}

impl<E: EmbeddingProvider> Inner<E> {
    async fn process(&self, job: &Job) -> Result<Outcome> {
        let path = self.scanner.absolute(&job.document);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => Some(m),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match metadata {
            Some(meta) if self.scanner.is_tracked(&job.document) => {
                if job.kind == ChangeKind::Removed {
                    tracing::debug!(document = %job.document, "removed file is back, reindexing");
                }
                let modified_at = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
                self.index_file(&job.document, &path, modified_at).await
            }
            _ => self.remove(&job.document).await,
        }
    }

    async fn remove(&self, id: &str) -> Result<Outcome> {
        if self.index.document(id).is_none() {
            return Ok(Outcome::Absent);
        }
        let chunks = self.index.delete_by_document(id).await?;
        Ok(Outcome::Removed { chunks })
    }

    async fn index_file(&self, id: &str, path: &Path, modified_at: i64) -> Result<Outcome> {
        let bytes = tokio::fs::read(path).await?;
        let hash = blake3_hex(&bytes);

        if let Some(record) = self.index.document(id)
            && record.status == DocumentStatus::Indexed
            && record.content_hash == hash
            && self.index.model_tag() == self.provider.model_tag()
        {
            return Ok(Outcome::Skipped);
        }

        let extracted = self.extractors.extract(path, &bytes)?;
        let cfg = &self.config.chunker;
        let spans = match extracted.lang {
            Some(lang) => chunk_code(&extracted.text, lang, cfg),
            None => chunk(&extracted.text, cfg.max_size, cfg.overlap),
        };
        let embeddings = self.embed_spans(&spans).await?;

        let chunks: Vec<NewChunk> = spans
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (span, embedding))| {
                let (line_start, line_end) = line_range(&extracted.text, span.start, span.end);
                NewChunk {
                    ordinal: u32::try_from(i).unwrap_or(u32::MAX),
                    embedding,
                    meta: ChunkMeta {
                        start: span.start,
                        end: span.end,
                        line_start,
                        line_end,
                        text: span.text,
                    },
                }
            })
            .collect();
        let count = chunks.len();

        let generation = self
            .index
            .replace_document(
                DocumentVersion {
                    id: id.to_owned(),
                    content_hash: hash,
                    modified_at,
                },
                chunks,
            )
            .await?;
        Ok(Outcome::Indexed {
            chunks: count,
            generation,
        })
    }

    async fn embed_spans(&self, spans: &[Span]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(spans.len());
        for batch in spans.chunks(self.config.embed_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|s| s.text.clone()).collect();
            let _permit = self
                .embed_permits
                .acquire()
                .await
                .map_err(|_| IndexError::QueueClosed)?;
            let vectors = with_timeout(
                self.config.embed_timeout,
                self.provider.embed_batch(&texts),
            )
            .await?;
            if vectors.len() != texts.len() {
                return Err(LlmError::EmptyResponse {
                    provider: self.provider.name(),
                }
                .into());
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    fn record(&self, document: &str, outcome: Outcome) {
        match outcome {
            Outcome::Indexed { chunks, generation } => {
                self.counters.indexed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(document, chunks, generation, "document indexed");
            }
            Outcome::Skipped => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(document, "unchanged, skipped");
            }
            Outcome::Removed { chunks } => {
                self.counters.removed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(document, chunks, "document removed");
            }
            Outcome::Absent => {}
        }
    }
}
