//! Capability interfaces implemented per backend and selected at
//! construction time.

use async_trait::async_trait;

use crate::error::Result;
use crate::filter::Filter;
use crate::types::{ChunkId, Document, IndexEntry, SearchHit};

/// Anything reached over the network (or another process) that the retry
/// policy wraps.
pub trait ExternalService: Send + Sync {
    /// Stable name used in logs and error reports.
    fn name(&self) -> &str;
}

#[async_trait]
pub trait EmbeddingProvider: ExternalService {
    /// Identifier of the model; embeddings from different models never mix.
    fn model_id(&self) -> &str;
    /// Embedding dimensionality (D).
    fn dimension(&self) -> usize;
    /// Largest batch the provider accepts in one call.
    fn max_batch_size(&self) -> usize {
        64
    }
    /// Compute embeddings for a batch of input texts, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Pairwise (query, candidate) relevance model used by the rerank stage.
#[async_trait]
pub trait RerankModel: ExternalService {
    /// One score per candidate, in candidate order. Higher is better.
    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>>;
}

/// Dense index over fixed-dimension vectors with payload predicates.
///
/// Implementations allow concurrent `search` calls while an `upsert` is in
/// flight; a search may or may not observe the in-flight write.
pub trait VectorStore: Send + Sync {
    fn dim(&self) -> usize;
    /// Number of live (not deleted) entries.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Inserts or replaces entries by id.
    fn upsert(&self, entries: &[IndexEntry]) -> Result<()>;
    fn search(&self, query: &[f32], k: usize, filter: Option<&Filter>) -> Result<Vec<SearchHit>>;
    /// Removes ids; unknown ids are ignored. Returns how many were live.
    fn delete(&self, ids: &[ChunkId]) -> Result<usize>;
}

/// Lexical index over chunk text.
pub trait SparseStore: Send + Sync {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn index(&self, entries: &[IndexEntry]) -> Result<()>;
    fn search(&self, query: &str, k: usize, filter: Option<&Filter>) -> Result<Vec<SearchHit>>;
    fn delete(&self, ids: &[ChunkId]) -> Result<usize>;
}

/// Source of raw documents for ingestion.
pub trait DocumentLoader: Send + Sync {
    fn load(&self) -> Result<Vec<Document>>;
}
