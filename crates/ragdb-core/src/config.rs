//! Configuration loader and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `RAGDB_*` env
//! vars (`RAGDB_SEARCH__ALPHA=0.7` sets `search.alpha`). Raw keys can be read
//! with [`Config::get`]; [`Config::engine`] extracts and validates the typed
//! [`EngineConfig`].
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::chunking::ChunkStrategy;
use crate::error::{Error, Result};

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Like [`Config::load`] but reads the TOML files from `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(dir.join("config.toml")));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file(dir.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(dir.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(dir.join("config.test.toml"))),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("RAGDB_").split("__"));

        let config = Self { figment };
        config.validate_for_env(&env_name)?;
        Ok(config)
    }

    pub fn from_figment(figment: Figment) -> Self {
        Self { figment }
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::InvalidConfig(format!("Failed to get '{}': {}", key, e)))
    }

    pub fn engine(&self) -> Result<EngineConfig> {
        let engine: EngineConfig = self
            .figment
            .extract()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        engine.validate()?;
        Ok(engine)
    }

    fn validate_for_env(&self, env: &str) -> Result<()> {
        match env {
            "prod" | "production" => {
                let kind: ProviderKind = self.get("embedding.primary.kind")?;
                if kind == ProviderKind::Hashing {
                    tracing::warn!("hashing embeddings configured for production");
                }
            }
            "dev" | "development" | "test" | "testing" => {}
            other => tracing::debug!(env = other, "unrecognised RUST_ENV, using base config only"),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Cosine,
    Euclidean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantization {
    #[default]
    None,
    Scalar,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    Linear,
    #[default]
    Rrf,
}

/// How each source's scores are mapped to `[0, 1]` before linear fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreNormalization {
    /// Per-query min-max over the candidate set.
    #[default]
    MinMax,
    /// Scores are already comparable; clamp only.
    None,
}

/// Per-collection index settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    pub dimension: usize,
    pub metric: Metric,
    pub hnsw_m: usize,
    pub hnsw_ef_construct: usize,
    pub hnsw_ef_search: usize,
    pub quantization: Quantization,
    /// Candidate multiplier for the quantized pass before exact rescoring.
    pub oversample: usize,
    /// Below this estimated filter selectivity the index scans matches
    /// exactly instead of walking the graph.
    pub exact_filter_threshold: f32,
    pub seed: u64,
    pub bm25_k1: f32,
    pub bm25_b: f32,
    pub stemming: bool,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            dimension: 384,
            metric: Metric::Cosine,
            hnsw_m: 16,
            hnsw_ef_construct: 200,
            hnsw_ef_search: 64,
            quantization: Quantization::None,
            oversample: 4,
            exact_filter_threshold: 0.1,
            seed: 42,
            bm25_k1: 1.2,
            bm25_b: 0.75,
            stemming: false,
        }
    }
}

impl CollectionSettings {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));
        if self.dimension == 0 {
            return bad("collection.dimension must be positive");
        }
        if self.hnsw_m < 2 {
            return bad("collection.hnsw_m must be at least 2");
        }
        if self.hnsw_ef_construct == 0 || self.hnsw_ef_search == 0 {
            return bad("collection.hnsw_ef_construct and hnsw_ef_search must be positive");
        }
        if self.oversample == 0 {
            return bad("collection.oversample must be positive");
        }
        if !(0.0..=1.0).contains(&self.exact_filter_threshold) {
            return bad("collection.exact_filter_threshold must be within [0, 1]");
        }
        if self.bm25_k1 < 0.0 || !(0.0..=1.0).contains(&self.bm25_b) {
            return bad("collection.bm25_k1 must be >= 0 and bm25_b within [0, 1]");
        }
        Ok(())
    }
}

/// Query-time defaults; every field can be overridden per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchDefaults {
    pub fusion_method: FusionMethod,
    pub alpha: f32,
    pub rrf_k: f32,
    pub normalization: ScoreNormalization,
    pub score_threshold: Option<f32>,
    pub top_k: usize,
    /// Shortlist size handed to the reranker, as a multiple of `top_k`.
    pub rerank_multiplier: usize,
    pub deadline_ms: Option<u64>,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            fusion_method: FusionMethod::Rrf,
            alpha: 0.5,
            rrf_k: 60.0,
            normalization: ScoreNormalization::MinMax,
            score_threshold: None,
            top_k: 10,
            rerank_multiplier: 4,
            deadline_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Deterministic feature hashing; no network.
    #[default]
    Hashing,
    /// OpenAI-compatible `/embeddings` endpoint.
    Http,
    /// Local XLM-RoBERTa weights (feature `local-model`).
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub model_dir: Option<String>,
    pub max_batch_size: usize,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Hashing,
            model: "hashing-v1".to_string(),
            base_url: None,
            api_key_env: None,
            model_dir: None,
            max_batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub primary: ProviderSettings,
    pub fallback: Option<ProviderSettings>,
    pub cache_capacity: usize,
    /// Sub-batches in flight at once.
    pub concurrency: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self { primary: ProviderSettings::default(), fallback: None, cache_capacity: 10_000, concurrency: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 3, initial_backoff_ms: 100, multiplier: 2.0, max_backoff_ms: 2_000, call_timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub capacity: u64,
    pub cache_ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { capacity: 10_000, cache_ttl_seconds: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub raw_txt_dir: String,
    pub collection: String,
    pub chunking: ChunkStrategy,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self { raw_txt_dir: "./data/txt".to_string(), collection: "documents".to_string(), chunking: ChunkStrategy::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub collection: CollectionSettings,
    pub search: SearchDefaults,
    pub embedding: EmbeddingSettings,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
    pub data: DataSettings,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.collection.validate()?;
        let s = &self.search;
        if !(0.0..=1.0).contains(&s.alpha) {
            return Err(Error::InvalidConfig("search.alpha must be within [0, 1]".into()));
        }
        if s.rrf_k < 0.0 {
            return Err(Error::InvalidConfig("search.rrf_k must be >= 0".into()));
        }
        if s.score_threshold.is_some_and(|t| !(0.0..=1.0).contains(&t)) {
            return Err(Error::InvalidConfig("search.score_threshold must be within [0, 1]".into()));
        }
        if s.top_k == 0 || s.rerank_multiplier == 0 {
            return Err(Error::InvalidConfig("search.top_k and search.rerank_multiplier must be positive".into()));
        }
        if self.retry.max_attempts == 0 || self.retry.multiplier < 1.0 {
            return Err(Error::InvalidConfig("retry.max_attempts must be >= 1 and retry.multiplier >= 1".into()));
        }
        if self.embedding.primary.max_batch_size == 0 || self.embedding.concurrency == 0 {
            return Err(Error::InvalidConfig("embedding batch size and concurrency must be positive".into()));
        }
        if self.cache.cache_ttl_seconds == 0 {
            return Err(Error::InvalidConfig("cache.cache_ttl_seconds must be positive".into()));
        }
        self.data.chunking.validate().map_err(|e| Error::InvalidConfig(format!("data.chunking: {e}")))
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    // Expand env vars first
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    // Expand ~ at start
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
