//! `SQLite` persistence for the vector index.
//!
//! Chunks carry the generation they were written for; only rows whose generation
//! equals the owning document's generation are live. Installing a generation is one
//! transaction, so a crash leaves either the old chunk set or the new one.

use std::path::Path;
use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::error::{IndexError, Result};

/// Persisted per-document state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRow {
    pub id: String,
    pub content_hash: String,
    pub generation: i64,
    pub status: String,
    pub modified_at: i64,
    pub indexed_at: i64,
    pub last_error: Option<String>,
}

/// Persisted chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub document_id: String,
    pub ordinal: i64,
    pub generation: i64,
    pub start_offset: i64,
    pub end_offset: i64,
    pub line_start: i64,
    pub line_end: i64,
    pub text: String,
    pub embedding: Vec<f32>,
    pub model_tag: String,
    pub seq: i64,
}

type ChunkTuple = (
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    String,
    Vec<u8>,
    String,
    i64,
);

type DocumentTuple = (String, String, i64, String, i64, i64, Option<String>);

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database file and run migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        Self::with_pool(pool).await
    }

    /// In-memory database, private to this store.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!().run(&pool).await?;
        Ok(Self { pool })
    }

    /// Run a trivial query to confirm the file is a readable database.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Corrupted`] if the integrity check does not pass.
    pub async fn check_integrity(&self) -> Result<()> {
        let result: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;
        if result == "ok" {
            Ok(())
        } else {
            Err(IndexError::Corrupted(result))
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// # Errors
    ///
    /// Returns an error if the `SQLite` query fails.
    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM index_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.map(|(v,)| v))
    }

    /// # Errors
    ///
    /// Returns an error if the `SQLite` query fails.
    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO index_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the `SQLite` query fails.
    pub async fn load_documents(&self) -> Result<Vec<DocumentRow>> {
        let rows: Vec<DocumentTuple> = sqlx::query_as(
            "SELECT id, content_hash, generation, status, modified_at, indexed_at, last_error \
             FROM documents",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, content_hash, generation, status, modified_at, indexed_at, last_error)| {
                    DocumentRow {
                        id,
                        content_hash,
                        generation,
                        status,
                        modified_at,
                        indexed_at,
                        last_error,
                    }
                },
            )
            .collect())
    }

    /// Chunks belonging to each document's current generation, ordered by document and ordinal.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Corrupted`] if an embedding blob is malformed.
    pub async fn load_live_chunks(&self) -> Result<Vec<ChunkRow>> {
        let rows: Vec<ChunkTuple> = sqlx::query_as(
            "SELECT c.document_id, c.ordinal, c.generation, c.start_offset, c.end_offset, \
                    c.line_start, c.line_end, c.text, c.embedding, c.model_tag, c.seq \
             FROM chunks c JOIN documents d ON d.id = c.document_id \
             WHERE c.generation = d.generation \
             ORDER BY c.document_id, c.ordinal",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(doc, ordinal, generation, start, end, ls, le, text, blob, model_tag, seq)|
                 -> Result<ChunkRow> {
                    Ok(ChunkRow {
                        document_id: doc,
                        ordinal,
                        generation,
                        start_offset: start,
                        end_offset: end,
                        line_start: ls,
                        line_end: le,
                        text,
                        embedding: decode_embedding(&blob)?,
                        model_tag,
                        seq,
                    })
                },
            )
            .collect()
    }

    /// Replace a document's chunk set and bump its generation in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; the transaction is rolled back.
    pub async fn install_generation(&self, doc: &DocumentRow, chunks: &[ChunkRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            insert_chunk(&mut tx, chunk).await?;
        }

        upsert_document(&mut tx, doc).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Insert or replace one chunk and make sure its document row exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the `SQLite` statements fail.
    pub async fn upsert_chunk(&self, doc: &DocumentRow, chunk: &ChunkRow) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_document(&mut tx, doc).await?;
        insert_chunk(&mut tx, chunk).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove a document and all of its chunks. Returns the number of chunk rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the `SQLite` statements fail.
    pub async fn delete_document(&self, id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// # Errors
    ///
    /// Returns an error if the `SQLite` query fails.
    pub async fn update_status(&self, doc: &DocumentRow) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_document(&mut tx, doc).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop every chunk and forget content hashes so all documents are re-embedded.
    ///
    /// # Errors
    ///
    /// Returns an error if the `SQLite` statements fail.
    pub async fn clear_embeddings(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("UPDATE documents SET content_hash = ''")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the `SQLite` query fails.
    pub async fn max_seq(&self) -> Result<i64> {
        let (seq,): (Option<i64>,) = sqlx::query_as("SELECT MAX(seq) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq.unwrap_or(0))
    }

    /// # Errors
    ///
    /// Returns an error if the `SQLite` query fails.
    pub async fn chunk_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

async fn insert_chunk(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chunk: &ChunkRow,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO chunks \
         (document_id, ordinal, generation, start_offset, end_offset, line_start, line_end, \
          text, embedding, model_tag, seq) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&chunk.document_id)
    .bind(chunk.ordinal)
    .bind(chunk.generation)
    .bind(chunk.start_offset)
    .bind(chunk.end_offset)
    .bind(chunk.line_start)
    .bind(chunk.line_end)
    .bind(&chunk.text)
    .bind(encode_embedding(&chunk.embedding))
    .bind(&chunk.model_tag)
    .bind(chunk.seq)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_document(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    doc: &DocumentRow,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO documents \
         (id, content_hash, generation, status, modified_at, indexed_at, last_error) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&doc.id)
    .bind(&doc.content_hash)
    .bind(doc.generation)
    .bind(&doc.status)
    .bind(doc.modified_at)
    .bind(doc.indexed_at)
    .bind(&doc.last_error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Little-endian `f32` sequence.
#[must_use]
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// # Errors
///
/// Returns [`IndexError::Corrupted`] if the blob length is not a multiple of four.
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(IndexError::Corrupted(format!(
            "embedding blob of {} bytes",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
