//! ragdb-text
//!
//! Lexical side of the engine: a BM25 inverted index over chunk text,
//! tokenized with the tantivy analyzer from `analyzer`.
pub mod analyzer;
pub mod bm25;

pub use analyzer::Analyzer;
pub use bm25::{Bm25Index, Bm25Params};
