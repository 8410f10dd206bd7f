//! Hybrid retrieval: fusion of dense and sparse rankings, optional
//! reranking, a query cache and the engine that orchestrates them.

pub mod cache;
pub mod collection;
pub mod engine;
pub mod fusion;
pub mod rerank;

pub use cache::{QueryCache, QueryKey};
pub use collection::{Collection, FlatBm25, HnswBm25, StoreFactory};
pub use engine::{
    ChunkError, Engine, QueryStage, SearchRequest, SearchResponse, UpsertOptions, UpsertRecord, UpsertResponse,
    Warning,
};
pub use fusion::{fuse, single_source, FusedHit, FusionParams};
pub use rerank::{HttpRerankModel, Reranker, TermOverlapModel};
