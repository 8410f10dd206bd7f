//! OpenAI-compatible embedding endpoint (`POST {base_url}/embeddings`).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ragdb_core::traits::{EmbeddingProvider, ExternalService};
use ragdb_core::{Error, Result};

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    max_batch: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Result<Self> {
        // Per-call deadlines are enforced by the retry policy; this is a backstop.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {e}")))?;
        let model = model.into();
        Ok(Self {
            client,
            name: format!("http:{model}"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model,
            api_key: None,
            dimension,
            max_batch: 100,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_max_batch_size(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    fn fail(&self, message: String, transient: bool) -> Error {
        Error::provider(&self.name, message, transient)
    }
}

impl ExternalService for HttpEmbeddingProvider {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let mut request = self.client.post(&url).json(&EmbeddingRequest { input: texts, model: &self.model });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.fail(format!("request failed: {e}"), true))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let transient = status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            return Err(self.fail(format!("API error {status}: {body}"), transient));
        }
        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| self.fail(format!("failed to parse response: {e}"), false))?;
        if parsed.data.len() != texts.len() {
            return Err(self.fail(format!("expected {} embeddings, got {}", texts.len(), parsed.data.len()), false));
        }
        if parsed.data.iter().all(|d| d.index.is_some()) {
            parsed.data.sort_by_key(|d| d.index);
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
