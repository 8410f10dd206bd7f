//! Second-pass scoring of the fused shortlist with a pairwise model.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use ragdb_core::traits::{ExternalService, RerankModel};
use ragdb_core::{Error, Result, ResultSource, RetrievalResult};
use ragdb_embed::{Outcome, Resilient, RetryPolicy};
use ragdb_text::Analyzer;

/// Local lexical relevance: the share of distinct query terms the candidate
/// covers, with a small bonus for how densely they occur.
pub struct TermOverlapModel {
    analyzer: Analyzer,
}

impl TermOverlapModel {
    pub fn new(stemming: bool) -> Self {
        Self { analyzer: Analyzer::new(stemming) }
    }

    fn score_one(&self, query_terms: &HashSet<String>, candidate: &str) -> f32 {
        if query_terms.is_empty() {
            return 0.0;
        }
        let tokens = self.analyzer.tokens(candidate);
        if tokens.is_empty() {
            return 0.0;
        }
        let matched: HashSet<&String> = tokens.iter().filter(|t| query_terms.contains(*t)).collect();
        let occurrences = tokens.iter().filter(|t| query_terms.contains(*t)).count();
        let coverage = matched.len() as f32 / query_terms.len() as f32;
        let density = occurrences as f32 / tokens.len() as f32;
        0.9 * coverage + 0.1 * density
    }
}

impl Default for TermOverlapModel {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ExternalService for TermOverlapModel {
    fn name(&self) -> &str {
        "term-overlap"
    }
}

#[async_trait]
impl RerankModel for TermOverlapModel {
    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        let terms: HashSet<String> = self.analyzer.tokens(query).into_iter().collect();
        Ok(candidates.iter().map(|c| self.score_one(&terms, c)).collect())
    }
}

/// Cross-encoder served over HTTP (`POST {base_url}/rerank`, text-embeddings-
/// inference style).
pub struct HttpRerankModel {
    client: reqwest::Client,
    name: String,
    base_url: String,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
}

#[derive(Deserialize)]
struct RerankScore {
    index: usize,
    score: f32,
}

impl HttpRerankModel {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, name: format!("rerank:{base_url}"), base_url })
    }
}

impl ExternalService for HttpRerankModel {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl RerankModel for HttpRerankModel {
    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&RerankRequest { query, texts: candidates })
            .send()
            .await
            .map_err(|e| Error::provider(&self.name, format!("request failed: {e}"), true))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let transient = status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            return Err(Error::provider(&self.name, format!("API error {status}: {body}"), transient));
        }
        let parsed: Vec<RerankScore> = response
            .json()
            .await
            .map_err(|e| Error::provider(&self.name, format!("failed to parse response: {e}"), false))?;

        let mut scores = vec![None; candidates.len()];
        for item in parsed {
            if let Some(slot) = scores.get_mut(item.index) {
                *slot = Some(item.score);
            }
        }
        scores
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.ok_or_else(|| Error::provider(&self.name, format!("no score for candidate {i}"), false)))
            .collect()
    }
}

fn logistic(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// The rerank stage: model calls go through the shared retry/fallback
/// policy; results are returned best first, truncated to `k`.
pub struct Reranker {
    models: Resilient<dyn RerankModel>,
}

impl Reranker {
    pub fn new(model: Arc<dyn RerankModel>, policy: RetryPolicy) -> Self {
        Self { models: Resilient::new(model, policy) }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn RerankModel>) -> Self {
        self.models = self.models.with_fallback(fallback);
        self
    }

    #[instrument(skip_all, fields(candidates = candidates.len(), k))]
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievalResult>,
        k: usize,
    ) -> Result<Outcome<Vec<RetrievalResult>>> {
        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let outcome = self
            .models
            .call(|model| {
                let texts = &texts;
                async move { model.score(query, texts).await }
            })
            .await?;
        let mut scores = outcome.value;
        if scores.len() != candidates.len() {
            return Err(Error::RetrievalUnavailable(format!(
                "{} returned {} scores for {} candidates",
                outcome.served_by,
                scores.len(),
                candidates.len()
            )));
        }
        // Raw model logits are squashed so scores stay in [0, 1].
        if scores.iter().any(|s| !(0.0..=1.0).contains(s)) {
            for s in &mut scores {
                *s = logistic(*s);
            }
        }

        let mut reranked: Vec<RetrievalResult> = candidates
            .into_iter()
            .zip(scores)
            .map(|(mut c, s)| {
                c.score = if s.is_finite() { s } else { 0.0 };
                c.source = ResultSource::Reranked;
                c
            })
            .collect();
        // Stable: equal model scores keep the fused order.
        reranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        reranked.truncate(k);
        debug!(served_by = %outcome.served_by, kept = reranked.len(), "reranked shortlist");
        Ok(Outcome { value: reranked, fallback_used: outcome.fallback_used, served_by: outcome.served_by })
    }
}
