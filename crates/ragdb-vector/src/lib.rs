//! ragdb-vector
//!
//! Dense side of the engine. [`HnswIndex`] is the approximate graph index
//! with runtime tunables, optional quantization and filtered search;
//! [`FlatIndex`] is the exact brute-force baseline. Both implement
//! [`ragdb_core::traits::VectorStore`].
pub mod distance;
pub mod flat;
pub mod hnsw;
pub mod quantization;

pub use flat::FlatIndex;
pub use hnsw::{HnswIndex, HnswParams, IndexStats};
pub use ragdb_core::config::{Metric, Quantization};
