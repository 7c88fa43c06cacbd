//! Embedding provider implementations

use crate::config::ProviderLimits;
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use half::f16;

mod hashing;
mod http;
#[cfg(feature = "fastembed")]
mod local;

pub use hashing::HashingProvider;
pub use http::HttpEmbeddingProvider;
#[cfg(feature = "fastembed")]
pub use local::FastEmbedProvider;

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f16>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result from a vector of f16 embeddings.
    ///
    /// The dimension is inferred from the first embedding vector, or 0 when
    /// there are none.
    pub fn new(embeddings: Vec<Vec<f16>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Trait for embedding providers that can generate embeddings from text.
///
/// The pipeline only ever talks to this trait, so providers can be swapped
/// per job (benchmarking, migration) without touching chunking or storage.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for multiple texts (one provider call)
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Generate the embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>> {
        let texts = [text.to_string()];
        self.embed_texts(&texts)
            .await?
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::malformed("no embedding generated for text"))
    }

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Identifier stored next to every vector this provider produced.
    /// Two providers with the same name must produce comparable vectors.
    fn provider_name(&self) -> &str;

    /// Batch, rate and input limits for this provider
    fn limits(&self) -> ProviderLimits;
}

/// Normalize an f32 vector to unit length and convert it to f16.
pub fn normalize_to_f16(embedding: Vec<f32>) -> Vec<f16> {
    let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    embedding
        .into_iter()
        .map(|value| {
            if norm > 0.0 {
                f16::from_f32(value / norm)
            } else {
                f16::from_f32(value)
            }
        })
        .collect()
}
