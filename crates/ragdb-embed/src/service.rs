use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument};

use ragdb_core::config::{EmbeddingSettings, ProviderKind, ProviderSettings, RetrySettings};
use ragdb_core::traits::EmbeddingProvider;
use ragdb_core::{Error, Result};

use crate::cache::EmbeddingCache;
use crate::hashing::HashingProvider;
use crate::http::HttpEmbeddingProvider;
use crate::retry::{Resilient, RetryPolicy};

/// One embedded text.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedded {
    pub vector: Vec<f32>,
    /// Model that produced the vector (the fallback's id when it served).
    pub model_id: String,
    pub fallback_used: bool,
    pub cached: bool,
}

/// Per-item results of [`EmbeddingService::embed_batch`], in input order.
#[derive(Debug, Clone)]
pub struct BatchEmbedding {
    pub items: Vec<Result<Embedded>>,
    pub fallback_used: bool,
}

impl BatchEmbedding {
    pub fn failures(&self) -> usize {
        self.items.iter().filter(|r| r.is_err()).count()
    }

    pub fn all_failed(&self) -> bool {
        !self.items.is_empty() && self.failures() == self.items.len()
    }
}

/// Batches, caches and retries calls to the configured embedding provider.
pub struct EmbeddingService {
    providers: Resilient<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    concurrency: usize,
}

impl EmbeddingService {
    pub fn new(primary: Arc<dyn EmbeddingProvider>, policy: RetryPolicy) -> Self {
        Self {
            providers: Resilient::new(primary, policy),
            cache: Arc::new(EmbeddingCache::new(10_000)),
            concurrency: 4,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn EmbeddingProvider>) -> Self {
        self.providers = self.providers.with_fallback(fallback);
        self
    }

    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Builds providers from configuration. `dimension` is the collection
    /// dimension every provider is expected to produce.
    pub fn from_settings(settings: &EmbeddingSettings, retry: &RetrySettings, dimension: usize) -> Result<Self> {
        let primary = build_provider(&settings.primary, dimension)?;
        let mut service = Self::new(primary, RetryPolicy::from(retry))
            .with_cache(Arc::new(EmbeddingCache::new(settings.cache_capacity)))
            .with_concurrency(settings.concurrency);
        if let Some(fallback) = &settings.fallback {
            service = service.with_fallback(build_provider(fallback, dimension)?);
        }
        info!(
            primary = service.model_id(),
            fallback = service.providers.fallback().map(|p| p.model_id()),
            dimension,
            "embedding service ready"
        );
        Ok(service)
    }

    pub fn model_id(&self) -> &str {
        self.providers.primary().model_id()
    }

    pub fn dimension(&self) -> usize {
        self.providers.primary().dimension()
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub async fn embed(&self, text: &str) -> Result<Embedded> {
        let batch = self.embed_batch(&[text.to_string()]).await;
        batch
            .items
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(Error::Operation("embedding batch returned no items".into())))
    }

    /// Embeds `texts`, splitting them into provider-sized sub-batches that run
    /// with bounded concurrency. A failed sub-batch fails only its own items.
    #[instrument(skip_all, fields(texts = texts.len()))]
    pub async fn embed_batch(&self, texts: &[String]) -> BatchEmbedding {
        let primary_model = self.model_id().to_string();
        let mut items: Vec<Option<Result<Embedded>>> = texts
            .iter()
            .map(|text| {
                self.cache.get(&primary_model, text).map(|vector| {
                    Ok(Embedded { vector, model_id: primary_model.clone(), fallback_used: false, cached: true })
                })
            })
            .collect();
        let misses: Vec<usize> = (0..texts.len()).filter(|&i| items[i].is_none()).collect();
        debug!(cached = texts.len() - misses.len(), misses = misses.len(), "embedding cache lookup");

        let batch_size = self.batch_size();
        let batches: Vec<_> = misses.chunks(batch_size).map(|idxs| {
            let batch: Vec<String> = idxs.iter().map(|&i| texts[i].clone()).collect();
            let primary_model = primary_model.as_str();
            async move {
                let outcome = self
                    .providers
                    .call(|provider| {
                        let batch = &batch;
                        async move {
                            if provider.model_id() == primary_model {
                                let vectors = provider.embed_batch(batch).await?;
                                let fresh = vec![true; vectors.len()];
                                Ok((provider.model_id().to_string(), vectors, fresh))
                            } else {
                                self.embed_with_cache(provider.as_ref(), batch).await
                            }
                        }
                    })
                    .await;
                (idxs, outcome)
            }
        }).collect();
        let results: Vec<_> = stream::iter(batches)
        .buffered(self.concurrency)
        .collect()
        .await;

        let mut fallback_used = false;
        for (idxs, outcome) in results {
            match outcome {
                Ok(outcome) if outcome.value.1.len() == idxs.len() => {
                    fallback_used |= outcome.fallback_used;
                    let (model_id, vectors, fresh) = outcome.value;
                    for ((&i, vector), fresh) in idxs.iter().zip(vectors).zip(fresh) {
                        if fresh {
                            self.cache.put(&model_id, &texts[i], vector.clone());
                        }
                        items[i] = Some(Ok(Embedded {
                            vector,
                            model_id: model_id.clone(),
                            fallback_used: outcome.fallback_used,
                            cached: !fresh,
                        }));
                    }
                }
                Ok(outcome) => {
                    let err = Error::provider(
                        &outcome.served_by,
                        format!("returned {} vectors for {} inputs", outcome.value.1.len(), idxs.len()),
                        false,
                    );
                    for &i in idxs {
                        items[i] = Some(Err(err.clone()));
                    }
                }
                Err(err) => {
                    for &i in idxs {
                        items[i] = Some(Err(err.clone()));
                    }
                }
            }
        }

        BatchEmbedding {
            items: items
                .into_iter()
                .map(|item| item.unwrap_or_else(|| Err(Error::Operation("text was never embedded".into()))))
                .collect(),
            fallback_used,
        }
    }
}

impl EmbeddingService {
    /// Sub-batch size every configured provider accepts.
    fn batch_size(&self) -> usize {
        let primary = self.providers.primary().max_batch_size();
        let limit = match self.providers.fallback() {
            Some(fallback) => primary.min(fallback.max_batch_size()),
            None => primary,
        };
        limit.max(1)
    }

    /// Calls a non-primary provider for the texts it has not embedded before.
    /// The flags mark which vectors are fresh from the provider.
    async fn embed_with_cache(
        &self,
        provider: &dyn EmbeddingProvider,
        batch: &[String],
    ) -> Result<(String, Vec<Vec<f32>>, Vec<bool>)> {
        let model = provider.model_id().to_string();
        let mut vectors: Vec<Option<Vec<f32>>> = batch.iter().map(|t| self.cache.get(&model, t)).collect();
        let missing: Vec<usize> = (0..batch.len()).filter(|&i| vectors[i].is_none()).collect();
        let fresh: Vec<bool> = vectors.iter().map(Option::is_none).collect();
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| batch[i].clone()).collect();
            let embedded = provider.embed_batch(&texts).await?;
            if embedded.len() != missing.len() {
                return Err(Error::provider(
                    provider.name(),
                    format!("returned {} vectors for {} inputs", embedded.len(), missing.len()),
                    false,
                ));
            }
            for (i, vector) in missing.into_iter().zip(embedded) {
                vectors[i] = Some(vector);
            }
        }
        debug!(model = %model, reused = fresh.iter().filter(|f| !**f).count(), "fallback cache lookup");
        Ok((model, vectors.into_iter().flatten().collect(), fresh))
    }
}

fn build_provider(settings: &ProviderSettings, dimension: usize) -> Result<Arc<dyn EmbeddingProvider>> {
    match settings.kind {
        ProviderKind::Hashing => Ok(Arc::new(HashingProvider::new(dimension).with_model_id(settings.model.clone()))),
        ProviderKind::Http => {
            let base_url = settings
                .base_url
                .as_deref()
                .ok_or_else(|| Error::InvalidConfig("http provider requires base_url".into()))?;
            let mut provider = HttpEmbeddingProvider::new(base_url, settings.model.clone(), dimension)?
                .with_max_batch_size(settings.max_batch_size);
            if let Some(var) = &settings.api_key_env {
                let key = std::env::var(var)
                    .map_err(|_| Error::InvalidConfig(format!("api key variable {var} is not set")))?;
                provider = provider.with_api_key(key);
            }
            Ok(Arc::new(provider))
        }
        #[cfg(feature = "local-model")]
        ProviderKind::Local => {
            let dir = settings
                .model_dir
                .as_deref()
                .ok_or_else(|| Error::InvalidConfig("local provider requires model_dir".into()))?;
            let provider = crate::local::LocalModelProvider::load(ragdb_core::config::expand_path(dir), &settings.model)?;
            if provider.dimension() != dimension {
                return Err(Error::InvalidConfig(format!(
                    "model {} produces {} dimensions, collection expects {dimension}",
                    settings.model,
                    provider.dimension()
                )));
            }
            Ok(Arc::new(provider))
        }
        #[cfg(not(feature = "local-model"))]
        ProviderKind::Local => {
            Err(Error::InvalidConfig("local provider requires the `local-model` feature".into()))
        }
    }
}
