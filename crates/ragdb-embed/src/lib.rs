//! Embedding providers and the service that batches, caches and retries
//! calls to them.

pub mod cache;
pub mod hashing;
pub mod http;
#[cfg(feature = "local-model")]
pub mod local;
pub mod retry;
pub mod service;

pub use cache::{CacheStats, EmbeddingCache};
pub use hashing::HashingProvider;
pub use http::HttpEmbeddingProvider;
#[cfg(feature = "local-model")]
pub use local::LocalModelProvider;
pub use retry::{Outcome, Resilient, RetryPolicy};
pub use service::{BatchEmbedding, Embedded, EmbeddingService};
