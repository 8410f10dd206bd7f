use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use twox_hash::XxHash64;

use ragdb_core::traits::{EmbeddingProvider, ExternalService};
use ragdb_core::Result;

/// Feature-hashing embedder: every lowercased word adds weight to an xxhash
/// bucket, then the vector is L2-normalized. Deterministic and offline, so
/// texts sharing words end up close together. Used by tests and the CLI
/// when no model is configured.
pub struct HashingProvider {
    dim: usize,
    model_id: String,
    max_batch: usize,
}

impl HashingProvider {
    pub fn new(dim: usize) -> Self {
        Self { dim, model_id: format!("hashing-xxh64-d{dim}"), max_batch: 256 }
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        if self.dim == 0 {
            return v;
        }
        for token in text.split_whitespace() {
            let token: String = token.chars().filter(|c| c.is_alphanumeric()).flat_map(char::to_lowercase).collect();
            if token.is_empty() {
                continue;
            }
            let mut hasher = XxHash64::with_seed(0);
            token.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h % self.dim as u64) as usize;
            let val = ((h >> 32) as u32) as f32 / u32::MAX as f32;
            v[idx] += 0.5 + val;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        for x in &mut v {
            *x /= norm;
        }
        v
    }
}

impl ExternalService for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
