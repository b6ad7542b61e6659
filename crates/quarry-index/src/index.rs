//! Vector index with per-document generations and snapshot reads.
//!
//! Readers clone an `Arc` to the current [`Snapshot`] and score it without holding any
//! lock, so a query observes each document either before or after a write, never halfway.
//! Writers serialize per document; the snapshot swap itself is a short critical section.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::store::{ChunkRow, DocumentRow, SqliteStore};

const META_DIMENSION: &str = "dimension";
const META_MODEL_TAG: &str = "model_tag";
const META_LAST_FULL_SCAN: &str = "last_full_scan";

/// Chunk identity: owning document plus ordinal within that document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    pub document: String,
    pub ordinal: u32,
}

impl ChunkId {
    #[must_use]
    pub fn new(document: impl Into<String>, ordinal: u32) -> Self {
        Self {
            document: document.into(),
            ordinal,
        }
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.document, self.ordinal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentStatus {
    Indexed,
    /// Excluded from queries until the next successful index attempt.
    IndexFailed,
}

impl DocumentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Indexed => "indexed",
            Self::IndexFailed => "index-failed",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "index-failed" {
            Self::IndexFailed
        } else {
            Self::Indexed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: String,
    pub content_hash: String,
    pub generation: u64,
    pub status: DocumentStatus,
    /// Unix seconds of the file's last modification.
    pub modified_at: i64,
    pub indexed_at: i64,
    pub last_error: Option<String>,
}

impl DocumentRecord {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            content_hash: String::new(),
            generation: 0,
            status: DocumentStatus::Indexed,
            modified_at: 0,
            indexed_at: 0,
            last_error: None,
        }
    }

    fn to_row(&self) -> DocumentRow {
        DocumentRow {
            id: self.id.clone(),
            content_hash: self.content_hash.clone(),
            generation: to_i64(self.generation),
            status: self.status.as_str().to_owned(),
            modified_at: self.modified_at,
            indexed_at: self.indexed_at,
            last_error: self.last_error.clone(),
        }
    }

    fn from_row(row: DocumentRow) -> Self {
        Self {
            status: DocumentStatus::parse(&row.status),
            generation: u64::try_from(row.generation).unwrap_or(0),
            id: row.id,
            content_hash: row.content_hash,
            modified_at: row.modified_at,
            indexed_at: row.indexed_at,
            last_error: row.last_error,
        }
    }
}

/// Location and text of a chunk within its document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub start: usize,
    pub end: usize,
    pub line_start: usize,
    pub line_end: usize,
    pub text: String,
}

/// A chunk to install as part of a new document generation.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub ordinal: u32,
    pub embedding: Vec<f32>,
    pub meta: ChunkMeta,
}

/// What the pipeline knows about the document version being installed.
#[derive(Debug, Clone)]
pub struct DocumentVersion {
    pub id: String,
    pub content_hash: String,
    pub modified_at: i64,
}

#[derive(Debug)]
pub struct StoredChunk {
    pub id: ChunkId,
    pub meta: ChunkMeta,
    pub embedding: Vec<f32>,
    pub generation: u64,
    pub model_tag: String,
    /// Insertion sequence; larger is more recent.
    pub seq: u64,
    norm: f32,
}

impl StoredChunk {
    #[must_use]
    pub fn new(
        id: ChunkId,
        meta: ChunkMeta,
        embedding: Vec<f32>,
        generation: u64,
        model_tag: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            norm: norm(&embedding),
            id,
            meta,
            embedding,
            generation,
            model_tag: model_tag.into(),
            seq,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Arc<StoredChunk>,
    pub score: f32,
    pub modified_at: i64,
}

/// Optional query restrictions. Failed documents are always excluded unless asked for.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub documents: Option<HashSet<String>>,
    pub exclude: HashSet<String>,
    pub path_prefix: Option<String>,
    pub include_failed: bool,
}

impl QueryFilter {
    fn allows(&self, record: &DocumentRecord) -> bool {
        if record.status == DocumentStatus::IndexFailed && !self.include_failed {
            return false;
        }
        if self.exclude.contains(&record.id) {
            return false;
        }
        if let Some(ref only) = self.documents
            && !only.contains(&record.id)
        {
            return false;
        }
        self.path_prefix
            .as_deref()
            .is_none_or(|prefix| record.id.starts_with(prefix))
    }
}

#[derive(Debug)]
struct DocEntry {
    record: DocumentRecord,
    chunks: Vec<Arc<StoredChunk>>,
}

#[derive(Debug, Default, Clone)]
struct Snapshot {
    docs: HashMap<String, Arc<DocEntry>>,
}

pub struct VectorIndex {
    store: SqliteStore,
    snapshot: RwLock<Arc<Snapshot>>,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    dimension: usize,
    model_tag: String,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .field("model_tag", &self.model_tag)
            .finish_non_exhaustive()
    }
}

impl VectorIndex {
    /// Open the on-disk index, loading the live generation of every document.
    ///
    /// A changed embedding model tag drops all stored vectors so that documents
    /// are re-embedded; their rows stay so removals are still detected.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] if the stored dimension differs for the same
    /// model, and [`IndexError::Corrupted`] or a database error if the file is unreadable.
    pub async fn open(path: &Path, dimension: usize, model_tag: &str) -> Result<Self> {
        let store = SqliteStore::open(path).await?;
        Self::init(store, dimension, model_tag).await
    }

    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be initialized.
    pub async fn open_in_memory(dimension: usize, model_tag: &str) -> Result<Self> {
        let store = SqliteStore::open_in_memory().await?;
        Self::init(store, dimension, model_tag).await
    }

    /// Like [`open`](Self::open), but moves an unreadable database aside and starts fresh.
    /// The flag is `true` when the index was recreated.
    ///
    /// # Errors
    ///
    /// Configuration errors such as a dimension mismatch are returned unchanged.
    pub async fn open_or_recreate(
        path: &Path,
        dimension: usize,
        model_tag: &str,
    ) -> Result<(Self, bool)> {
        match Self::open(path, dimension, model_tag).await {
            Ok(index) => Ok((index, false)),
            Err(e @ (IndexError::Corrupted(_) | IndexError::Sqlite(_) | IndexError::Migrate(_))) => {
                tracing::warn!(path = %path.display(), "index unreadable, recreating: {e}");
                let aside = path.with_extension("db.corrupt");
                tokio::fs::rename(path, &aside).await?;
                for suffix in ["-wal", "-shm"] {
                    let side = format!("{}{suffix}", path.display());
                    let _ = tokio::fs::remove_file(side).await;
                }
                let index = Self::open(path, dimension, model_tag).await?;
                Ok((index, true))
            }
            Err(e) => Err(e),
        }
    }

    async fn init(store: SqliteStore, dimension: usize, model_tag: &str) -> Result<Self> {
        store.check_integrity().await?;

        let stored_tag = store.get_meta(META_MODEL_TAG).await?;
        let stored_dim = store
            .get_meta(META_DIMENSION)
            .await?
            .and_then(|v| v.parse::<usize>().ok());

        match stored_tag {
            Some(ref tag) if tag != model_tag => {
                tracing::warn!(
                    old = %tag,
                    new = model_tag,
                    "embedding model changed, dropping stored vectors"
                );
                store.clear_embeddings().await?;
            }
            _ => {
                if let Some(expected) = stored_dim
                    && expected != dimension
                {
                    return Err(IndexError::DimensionMismatch {
                        expected,
                        actual: dimension,
                    });
                }
            }
        }
        store.set_meta(META_MODEL_TAG, model_tag).await?;
        store
            .set_meta(META_DIMENSION, &dimension.to_string())
            .await?;

        let mut docs: HashMap<String, DocEntry> = store
            .load_documents()
            .await?
            .into_iter()
            .map(|row| {
                let record = DocumentRecord::from_row(row);
                (
                    record.id.clone(),
                    DocEntry {
                        record,
                        chunks: Vec::new(),
                    },
                )
            })
            .collect();

        let mut loaded = 0usize;
        for row in store.load_live_chunks().await? {
            if row.embedding.len() != dimension {
                return Err(IndexError::Corrupted(format!(
                    "chunk {}#{} has {} dimensions",
                    row.document_id,
                    row.ordinal,
                    row.embedding.len()
                )));
            }
            if let Some(entry) = docs.get_mut(&row.document_id) {
                entry.chunks.push(Arc::new(chunk_from_row(row)));
                loaded += 1;
            }
        }

        let next_seq = u64::try_from(store.max_seq().await?).unwrap_or(0) + 1;
        tracing::info!(
            documents = docs.len(),
            chunks = loaded,
            dimension,
            model = model_tag,
            "vector index opened"
        );

        let snapshot = Snapshot {
            docs: docs.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        };
        Ok(Self {
            store,
            snapshot: RwLock::new(Arc::new(snapshot)),
            write_locks: Mutex::new(HashMap::new()),
            dimension,
            model_tag: model_tag.to_owned(),
            next_seq: AtomicU64::new(next_seq),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn model_tag(&self) -> &str {
        &self.model_tag
    }

    /// Number of live chunk entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().docs.values().map(|d| d.chunks.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn document(&self, id: &str) -> Option<DocumentRecord> {
        self.snapshot().docs.get(id).map(|d| d.record.clone())
    }

    #[must_use]
    pub fn documents(&self) -> Vec<DocumentRecord> {
        let mut out: Vec<_> = self
            .snapshot()
            .docs
            .values()
            .map(|d| d.record.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Current generation of a document, 0 if unknown.
    #[must_use]
    pub fn generation(&self, id: &str) -> u64 {
        self.snapshot()
            .docs
            .get(id)
            .map_or(0, |d| d.record.generation)
    }

    /// Live chunks of one document in ordinal order.
    #[must_use]
    pub fn chunks_of(&self, id: &str) -> Vec<Arc<StoredChunk>> {
        self.snapshot()
            .docs
            .get(id)
            .map(|d| d.chunks.clone())
            .unwrap_or_default()
    }

    /// Replace or insert a single chunk entry in its document's current generation.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] for a wrong-sized vector and
    /// [`IndexError::Unavailable`] if the store cannot be written.
    pub async fn upsert(&self, id: ChunkId, embedding: Vec<f32>, meta: ChunkMeta) -> Result<()> {
        self.ensure_open()?;
        self.check_dimension(embedding.len())?;

        let lock = self.doc_lock(&id.document);
        let _guard = lock.lock().await;

        let current = self.snapshot().docs.get(&id.document).cloned();
        let mut record = current
            .as_ref()
            .map_or_else(|| DocumentRecord::new(&id.document), |d| d.record.clone());
        if record.generation == 0 {
            record.generation = 1;
            record.indexed_at = now_secs();
        }

        let chunk = self.make_chunk(id.clone(), embedding, meta, record.generation);
        self.store
            .upsert_chunk(&record.to_row(), &chunk_to_row(&chunk))
            .await
            .map_err(unavailable)?;

        let mut chunks: Vec<Arc<StoredChunk>> = current
            .map(|d| {
                d.chunks
                    .iter()
                    .filter(|c| c.id != id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        chunks.push(Arc::new(chunk));
        chunks.sort_by_key(|c| c.id.ordinal);

        self.install(&id.document, Some(DocEntry { record, chunks }));
        Ok(())
    }

    /// Atomically replace a document's chunk set with a new generation.
    ///
    /// The new entries are durably written before the generation becomes visible, so a
    /// failure leaves the previous generation in place. Returns the new generation.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] if any vector has the wrong size and
    /// [`IndexError::Unavailable`] if the store cannot be written.
    pub async fn replace_document(
        &self,
        version: DocumentVersion,
        new_chunks: Vec<NewChunk>,
    ) -> Result<u64> {
        self.ensure_open()?;
        for c in &new_chunks {
            self.check_dimension(c.embedding.len())?;
        }

        let lock = self.doc_lock(&version.id);
        let _guard = lock.lock().await;

        let generation = self.generation(&version.id) + 1;
        let record = DocumentRecord {
            id: version.id.clone(),
            content_hash: version.content_hash,
            generation,
            status: DocumentStatus::Indexed,
            modified_at: version.modified_at,
            indexed_at: now_secs(),
            last_error: None,
        };

        let mut chunks: Vec<StoredChunk> = new_chunks
            .into_iter()
            .map(|c| {
                self.make_chunk(
                    ChunkId::new(version.id.clone(), c.ordinal),
                    c.embedding,
                    c.meta,
                    generation,
                )
            })
            .collect();
        chunks.sort_by_key(|c| c.id.ordinal);

        let rows: Vec<ChunkRow> = chunks.iter().map(chunk_to_row).collect();
        self.store
            .install_generation(&record.to_row(), &rows)
            .await
            .map_err(unavailable)?;

        tracing::debug!(
            document = %version.id,
            generation,
            chunks = rows.len(),
            "generation installed"
        );
        self.install(
            &version.id,
            Some(DocEntry {
                record,
                chunks: chunks.into_iter().map(Arc::new).collect(),
            }),
        );
        Ok(generation)
    }

    /// Remove every chunk of a document. Returns the number of live chunks removed.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Unavailable`] if the store cannot be written.
    pub async fn delete_by_document(&self, id: &str) -> Result<usize> {
        self.ensure_open()?;
        let lock = self.doc_lock(id);
        let _guard = lock.lock().await;

        let live = self.snapshot().docs.get(id).map_or(0, |d| d.chunks.len());
        self.store.delete_document(id).await.map_err(unavailable)?;
        self.install(id, None);
        Ok(live)
    }

    /// Flag a document as failed; its chunks stay stored but are excluded from queries.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Unavailable`] if the store cannot be written.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.ensure_open()?;
        let lock = self.doc_lock(id);
        let _guard = lock.lock().await;

        let current = self.snapshot().docs.get(id).cloned();
        let mut record = current
            .as_ref()
            .map_or_else(|| DocumentRecord::new(id), |d| d.record.clone());
        record.status = DocumentStatus::IndexFailed;
        record.last_error = Some(error.to_owned());

        self.store
            .update_status(&record.to_row())
            .await
            .map_err(unavailable)?;

        let chunks = current.map(|d| d.chunks.clone()).unwrap_or_default();
        self.install(id, Some(DocEntry { record, chunks }));
        Ok(())
    }

    /// Top `k` chunks by cosine similarity; ties go to the most recently inserted chunk.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Unavailable`] after [`close`](Self::close) and
    /// [`IndexError::DimensionMismatch`] for a wrong-sized query vector.
    pub fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        self.ensure_open()?;
        self.check_dimension(embedding.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let default_filter = QueryFilter::default();
        let filter = filter.unwrap_or(&default_filter);
        let query_norm = norm(embedding);
        let snapshot = self.snapshot();

        let mut hits: Vec<ScoredChunk> = snapshot
            .docs
            .values()
            .filter(|d| filter.allows(&d.record))
            .flat_map(|d| {
                d.chunks.iter().map(|c| ScoredChunk {
                    score: cosine(embedding, query_norm, c),
                    chunk: Arc::clone(c),
                    modified_at: d.record.modified_at,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.chunk.seq.cmp(&a.chunk.seq))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Record that a full scan of the workspace finished now.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn record_full_scan(&self) -> Result<()> {
        self.store
            .set_meta(META_LAST_FULL_SCAN, &now_secs().to_string())
            .await
    }

    /// True when no full scan was recorded or the last one is older than `max_age`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn needs_full_scan(&self, max_age: Duration) -> Result<bool> {
        let Some(last) = self
            .store
            .get_meta(META_LAST_FULL_SCAN)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
        else {
            return Ok(true);
        };
        let age = now_secs().saturating_sub(last);
        Ok(u64::try_from(age).unwrap_or(0) > max_age.as_secs())
    }

    /// Stop serving reads and writes and close the database.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.store.close().await;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(IndexError::Unavailable("index closed".into()))
        } else {
            Ok(())
        }
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        if actual == self.dimension {
            Ok(())
        } else {
            Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual,
            })
        }
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn install(&self, id: &str, entry: Option<DocEntry>) {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Snapshot::clone(&guard);
        match entry {
            Some(entry) => {
                next.docs.insert(id.to_owned(), Arc::new(entry));
            }
            None => {
                next.docs.remove(id);
            }
        }
        *guard = Arc::new(next);
    }

    fn doc_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_owned()).or_default())
    }

    fn make_chunk(
        &self,
        id: ChunkId,
        embedding: Vec<f32>,
        meta: ChunkMeta,
        generation: u64,
    ) -> StoredChunk {
        StoredChunk::new(
            id,
            meta,
            embedding,
            generation,
            self.model_tag.clone(),
            self.next_seq.fetch_add(1, Ordering::SeqCst),
        )
    }
}

fn chunk_from_row(row: ChunkRow) -> StoredChunk {
    StoredChunk {
        norm: norm(&row.embedding),
        id: ChunkId::new(row.document_id, u32::try_from(row.ordinal).unwrap_or(u32::MAX)),
        meta: ChunkMeta {
            start: to_usize(row.start_offset),
            end: to_usize(row.end_offset),
            line_start: to_usize(row.line_start),
            line_end: to_usize(row.line_end),
            text: row.text,
        },
        embedding: row.embedding,
        generation: u64::try_from(row.generation).unwrap_or(0),
        model_tag: row.model_tag,
        seq: u64::try_from(row.seq).unwrap_or(0),
    }
}

fn chunk_to_row(chunk: &StoredChunk) -> ChunkRow {
    ChunkRow {
        document_id: chunk.id.document.clone(),
        ordinal: i64::from(chunk.id.ordinal),
        generation: to_i64(chunk.generation),
        start_offset: to_i64(chunk.meta.start),
        end_offset: to_i64(chunk.meta.end),
        line_start: to_i64(chunk.meta.line_start),
        line_end: to_i64(chunk.meta.line_end),
        text: chunk.meta.text.clone(),
        embedding: chunk.embedding.clone(),
        model_tag: chunk.model_tag.clone(),
        seq: to_i64(chunk.seq),
    }
}

fn unavailable(e: IndexError) -> IndexError {
    match e {
        IndexError::Sqlite(err) => IndexError::Unavailable(err.to_string()),
        other => other,
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine(query: &[f32], query_norm: f32, chunk: &StoredChunk) -> f32 {
    if query_norm == 0.0 || chunk.norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = query
        .iter()
        .zip(chunk.embedding.iter())
        .map(|(x, y)| x * y)
        .sum();
    (dot / (query_norm * chunk.norm)).clamp(-1.0, 1.0)
}

/// Cosine similarity of two raw vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (na, nb) = (norm(a), norm(b));
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    (dot / (na * nb)).clamp(-1.0, 1.0)
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn to_i64<T: TryInto<i64>>(v: T) -> i64 {
    v.try_into().unwrap_or(i64::MAX)
}

fn to_usize(v: i64) -> usize {
    usize::try_from(v).unwrap_or(0)
}
