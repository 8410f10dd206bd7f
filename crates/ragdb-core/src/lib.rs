//! ragdb-core
//!
//! Shared data model, error taxonomy and capability traits for the retrieval
//! engine, plus the chunker, payload filters, configuration and the `.txt`
//! document loader.

pub mod chunking;
pub mod config;
pub mod error;
pub mod filter;
pub mod loader;
pub mod telemetry;
pub mod traits;
pub mod types;

pub use error::{Error, ErrorKind, Result, ValidationError};
pub use filter::Filter;
pub use types::{
    Chunk, ChunkId, Document, Embedding, IndexEntry, Payload, ResultSource, RetrievalResult,
    SearchHit,
};
