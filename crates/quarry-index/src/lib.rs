//! Incremental indexing, vector search, and retrieval over a local corpus.
//!
//! Files are extracted to text, split into overlapping chunks, embedded, and installed
//! into a [`VectorIndex`](index::VectorIndex) one document generation at a time. Queries
//! read an immutable snapshot, so indexing never blocks retrieval.

pub mod chunker;
pub mod error;
pub mod extractor;
pub mod index;
pub mod languages;
pub mod pipeline;
pub mod queue;
pub mod retriever;
pub mod scanner;
pub mod store;
pub mod watcher;

pub use error::{IndexError, Result};
pub use index::VectorIndex;
pub use pipeline::{IndexingPipeline, PipelineConfig, PipelineStats};
pub use retriever::{RetrievalConfig, RetrievalContext, Retriever, SessionContext};
