//! Query → ranked retrieval context: semantic search, re-ranking, deduplication.

use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use quarry_llm::EmbeddingProvider;
use quarry_llm::provider::with_timeout;

use crate::error::{IndexError, Result};
use crate::index::{QueryFilter, ScoredChunk, StoredChunk, VectorIndex, cosine_similarity, now_secs};

/// Retrieval configuration.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Candidates fetched per requested chunk before re-ranking.
    pub overfetch: usize,
    /// Minimum cosine similarity to accept.
    pub min_score: f32,
    pub recency_weight: f32,
    pub recency_half_life: Duration,
    pub pinned_boost: f32,
    /// Same-document chunks at or above this similarity to a kept chunk are dropped.
    pub dedupe_similarity: f32,
    /// Chunks with this many non-whitespace characters or fewer are ignored.
    pub min_chunk_chars: usize,
    pub timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 4,
            overfetch: 3,
            min_score: 0.25,
            recency_weight: 0.1,
            recency_half_life: Duration::from_secs(72 * 3600),
            pinned_boost: 0.05,
            dedupe_similarity: 0.97,
            min_chunk_chars: 30,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Per-session retrieval preferences.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Documents the user is focused on; their chunks get a score boost.
    pub pinned: HashSet<String>,
    pub exclude: HashSet<String>,
    pub path_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Arc<StoredChunk>,
    /// Raw cosine similarity to the query.
    pub similarity: f32,
    /// Similarity after recency and pin boosts; determines rank.
    pub score: f32,
}

impl RetrievedChunk {
    #[must_use]
    pub fn document(&self) -> &str {
        &self.chunk.id.document
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.chunk.meta.text
    }
}

/// Ranked chunks for one turn. Empty means "answer from general knowledge".
#[derive(Debug, Clone, Default)]
pub struct RetrievalContext {
    pub chunks: Vec<RetrievedChunk>,
}

impl RetrievalContext {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// The best `k` chunks.
    #[must_use]
    pub fn truncated(&self, k: usize) -> Self {
        Self {
            chunks: self.chunks.iter().take(k).cloned().collect(),
        }
    }
}

pub struct Retriever<E: EmbeddingProvider> {
    index: Arc<VectorIndex>,
    provider: Arc<E>,
    config: RetrievalConfig,
}

impl<E: EmbeddingProvider> Retriever<E> {
    #[must_use]
    pub fn new(index: Arc<VectorIndex>, provider: Arc<E>, config: RetrievalConfig) -> Self {
        Self {
            index,
            provider,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve up to `k` chunks relevant to `query`.
    ///
    /// An empty or unavailable index yields an empty context rather than an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be embedded or its dimension does not match
    /// the index.
    pub async fn retrieve(
        &self,
        query: &str,
        session: &SessionContext,
        k: usize,
    ) -> Result<RetrievalContext> {
        if k == 0 || self.index.is_empty() {
            tracing::debug!("index empty, answering without context");
            return Ok(RetrievalContext::default());
        }

        let embedding = with_timeout(self.config.timeout, self.provider.embed(query)).await?;

        let filter = QueryFilter {
            exclude: session.exclude.clone(),
            path_prefix: session.path_prefix.clone(),
            ..QueryFilter::default()
        };
        let fetch = k.saturating_mul(self.config.overfetch.max(1));
        let candidates = match self.index.query(&embedding, fetch, Some(&filter)) {
            Ok(candidates) => candidates,
            Err(IndexError::Unavailable(reason)) => {
                tracing::warn!("index unavailable, answering without context: {reason}");
                return Ok(RetrievalContext::default());
            }
            Err(e) => return Err(e),
        };

        let chunks = self.rerank(candidates, session, k);
        tracing::debug!(
            query_chars = query.len(),
            fetched = fetch,
            kept = chunks.len(),
            "retrieval complete"
        );
        Ok(RetrievalContext { chunks })
    }

    fn rerank(
        &self,
        candidates: Vec<ScoredChunk>,
        session: &SessionContext,
        k: usize,
    ) -> Vec<RetrievedChunk> {
        let cfg = &self.config;
        let candidates: Vec<ScoredChunk> = candidates
            .into_iter()
            .filter(|c| non_whitespace_chars(&c.chunk.meta.text) > cfg.min_chunk_chars)
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let scores: Vec<f32> = candidates.iter().map(|c| c.score).collect();
        let threshold = dynamic_threshold(&scores, cfg.min_score);
        let now = now_secs();

        let mut ranked: Vec<RetrievedChunk> = candidates
            .into_iter()
            .filter(|c| c.score >= threshold)
            .map(|c| {
                let mut score = c.score + recency_boost(now, c.modified_at, cfg);
                if session.pinned.contains(&c.chunk.id.document) {
                    score += cfg.pinned_boost;
                }
                RetrievedChunk {
                    similarity: c.score,
                    score,
                    chunk: c.chunk,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.chunk.seq.cmp(&a.chunk.seq))
        });

        let mut kept: Vec<RetrievedChunk> = Vec::with_capacity(k);
        for candidate in ranked {
            if kept.len() == k {
                break;
            }
            let duplicate = kept.iter().any(|existing| {
                existing.document() == candidate.document()
                    && (normalize_text(existing.text()) == normalize_text(candidate.text())
                        || cosine_similarity(&existing.chunk.embedding, &candidate.chunk.embedding)
                            >= cfg.dedupe_similarity)
            });
            if !duplicate {
                kept.push(candidate);
            }
        }
        kept
    }
}

/// Score cut-off keeping the top 70% of the `[min_score, max]` band, never below `min_score`.
/// When the best score barely clears `min_score` the band is too narrow to split, and the
/// cut-off sits just under the average instead.
fn dynamic_threshold(scores: &[f32], min_score: f32) -> f32 {
    let max = scores.iter().copied().fold(f32::MIN, f32::max);
    let range = max - min_score;
    #[allow(clippy::cast_precision_loss)]
    let avg = scores.iter().sum::<f32>() / scores.len() as f32;

    let threshold = if range < 0.1 {
        min_score.max(avg - 0.05)
    } else {
        max - 0.3 * range
    };
    threshold.max(min_score)
}

fn recency_boost(now: i64, modified_at: i64, cfg: &RetrievalConfig) -> f32 {
    let half_life = cfg.recency_half_life.as_secs_f32();
    if cfg.recency_weight == 0.0 || half_life == 0.0 || modified_at <= 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let age = now.saturating_sub(modified_at).max(0) as f32;
    cfg.recency_weight * (-age / half_life).exp()
}

fn non_whitespace_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Format retrieved chunks as XML for injection into messages.
#[must_use]
pub fn format_as_context(context: &RetrievalContext) -> String {
    if context.is_empty() {
        return String::new();
    }

    let mut out = String::from("<retrieved_context>\n");
    for chunk in &context.chunks {
        let meta = &chunk.chunk.meta;
        let _ = writeln!(
            out,
            "  <chunk source=\"{}\" lines=\"{}-{}\" score=\"{:.2}\">",
            chunk.document(),
            meta.line_start,
            meta.line_end,
            chunk.similarity,
        );
        out.push_str(meta.text.trim_end());
        out.push_str("\n  </chunk>\n");
    }
    out.push_str("</retrieved_context>");
    out
}
