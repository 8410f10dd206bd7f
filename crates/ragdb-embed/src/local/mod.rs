//! XLM-RoBERTa family encoders (e.g. BGE-M3) loaded from a local directory
//! holding `tokenizer.json`, `config.json` and `pytorch_model.bin`.

mod device;
mod pool;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::xlm_roberta::{Config as XLMRobertaConfig, XLMRobertaModel};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use ragdb_core::traits::{EmbeddingProvider, ExternalService};
use ragdb_core::{Error, Result};

pub use device::select_device;
pub use pool::masked_mean_l2;

const MAX_TOKENS: usize = 256;
const PAD_ID: u32 = 1;

struct Encoder {
    model: XLMRobertaModel,
    tokenizer: Tokenizer,
    device: Device,
}

pub struct LocalModelProvider {
    encoder: Arc<Encoder>,
    model_id: String,
    dimension: usize,
}

fn load_err(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::InvalidConfig(format!("loading {}: {e}", path.display()))
}

fn model_err(e: impl std::fmt::Display) -> Error {
    Error::provider("local", e.to_string(), false)
}

impl LocalModelProvider {
    pub fn load(model_dir: PathBuf, model_id: &str) -> Result<Self> {
        let device = select_device();
        info!(dir = %model_dir.display(), model_id, "loading local embedding model");

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| load_err(&tokenizer_path, e))?;

        let config_path = model_dir.join("config.json");
        let raw = std::fs::read_to_string(&config_path).map_err(|e| load_err(&config_path, e))?;
        let config: XLMRobertaConfig = serde_json::from_str(&raw).map_err(|e| load_err(&config_path, e))?;
        let dimension = config.hidden_size;

        let weights_path = model_dir.join("pytorch_model.bin");
        let weights: HashMap<String, Tensor> = candle_core::pickle::read_all(&weights_path)
            .map_err(|e| load_err(&weights_path, e))?
            .into_iter()
            .collect();
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = XLMRobertaModel::new(&config, vb).map_err(|e| load_err(&model_dir, e))?;
        info!(dimension, "local embedding model loaded");

        Ok(Self { encoder: Arc::new(Encoder { model, tokenizer, device }), model_id: model_id.to_string(), dimension })
    }
}

impl Encoder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let mut ids = Vec::with_capacity(texts.len() * MAX_TOKENS);
        let mut mask = Vec::with_capacity(texts.len() * MAX_TOKENS);
        for text in texts {
            let enc = self.tokenizer.encode(text.as_str(), true).map_err(model_err)?;
            let n = enc.get_ids().len().min(MAX_TOKENS);
            ids.extend_from_slice(&enc.get_ids()[..n]);
            mask.extend_from_slice(&enc.get_attention_mask()[..n]);
            ids.extend(std::iter::repeat(PAD_ID).take(MAX_TOKENS - n));
            mask.extend(std::iter::repeat(0).take(MAX_TOKENS - n));
        }
        let shape = (texts.len(), MAX_TOKENS);
        let input_ids = Tensor::from_vec(ids, shape, &self.device).map_err(model_err)?;
        let attention_mask = Tensor::from_vec(mask, shape, &self.device).map_err(model_err)?;
        let token_type_ids = Tensor::zeros(shape, DType::I64, &self.device).map_err(model_err)?;
        let hidden = self
            .model
            .forward(&input_ids, &attention_mask, &token_type_ids, None, None, None)
            .map_err(model_err)?;
        let pooled = masked_mean_l2(&hidden, &attention_mask).map_err(model_err)?;
        let vectors: Vec<Vec<f32>> = pooled.to_device(&Device::Cpu).and_then(|t| t.to_vec2()).map_err(model_err)?;

        let elapsed = start.elapsed();
        if elapsed.as_millis() > 100 * texts.len() as u128 {
            warn!(?elapsed, batch = texts.len(), "slow embedding batch");
        } else {
            debug!(?elapsed, batch = texts.len(), "embedded batch");
        }
        Ok(vectors)
    }
}

impl ExternalService for LocalModelProvider {
    fn name(&self) -> &str {
        "local"
    }
}

#[async_trait]
impl EmbeddingProvider for LocalModelProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_batch_size(&self) -> usize {
        16
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let encoder = Arc::clone(&self.encoder);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || encoder.embed(&texts))
            .await
            .map_err(|e| Error::Operation(format!("embedding task failed: {e}")))?
    }
}
