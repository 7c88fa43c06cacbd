use super::{EmbeddingProvider, EmbeddingResult, normalize_to_f16};
use crate::config::ProviderLimits;
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const MODEL_NAME: &str = "all-minilm-l6-v2";

/// Local ONNX embeddings through fastembed (AllMiniLM-L6-v2).
#[derive(Clone)]
pub struct FastEmbedProvider {
    model: Arc<Mutex<TextEmbedding>>,
    dimension: usize,
    name: String,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("name", &self.name)
            .field("dimension", &self.dimension)
            .finish()
    }
}

fn run_model(model: &Mutex<TextEmbedding>, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
    let mut guard = model
        .lock()
        .map_err(|_| EmbedError::External {
            source: anyhow::anyhow!("embedding model lock poisoned"),
        })?;
    guard
        .embed(texts, None)
        .map_err(|e| EmbedError::External { source: e })
}

impl FastEmbedProvider {
    /// Load (downloading on first use) the model into `cache_dir`.
    pub async fn create(cache_dir: Option<PathBuf>) -> Result<Self> {
        tracing::info!(model = MODEL_NAME, "Initializing FastEmbed provider");

        let (model, dimension) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut options =
                InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(true);
            if let Some(dir) = cache_dir {
                options = options.with_cache_dir(dir);
            }
            let model = TextEmbedding::try_new(options).map_err(|e| EmbedError::External { source: e })?;
            let model = Mutex::new(model);

            let probe = run_model(&model, vec!["dimension probe".to_string()])?;
            let dimension = probe
                .first()
                .map(|e| e.len())
                .ok_or_else(|| EmbedError::malformed("model produced no probe embedding"))?;
            Ok((model, dimension))
        })
        .await??;

        tracing::info!(dimension, "Model loaded");
        Ok(Self {
            model: Arc::new(model),
            dimension,
            name: format!("fastembed:{MODEL_NAME}"),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let embeddings = tokio::task::spawn_blocking(move || run_model(&model, texts)).await??;

        let mut converted = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            if embedding.len() != self.dimension {
                return Err(EmbedError::DimensionMismatch {
                    expected: self.dimension,
                    actual: embedding.len(),
                });
            }
            converted.push(normalize_to_f16(embedding));
        }
        Ok(EmbeddingResult::new(converted))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits::new(self.dimension)
            .with_max_batch_items(16)
            .with_max_batch_tokens(16 * 256)
            .with_max_input_tokens(256)
    }
}
