//! # semdex-embed
//!
//! Embedding providers and the pipeline that feeds them.
//!
//! The [`EmbeddingPipeline`] turns [`semdex_context::TextChunk`]s into
//! [`EmbeddedChunk`]s. It groups chunks into batches that respect the
//! provider's [`ProviderLimits`], applies the provider's rate limit, retries
//! retryable failures with exponential backoff and keeps going when a single
//! batch fails for good.
//!
//! ## Providers
//!
//! - [`HashingProvider`]: deterministic FNV feature hashing, no network
//! - [`HttpEmbeddingProvider`]: any OpenAI-compatible `/embeddings` endpoint
//! - `FastEmbedProvider`: local ONNX models (requires the `fastembed` feature)
//!
//! All vectors are unit length and stored as `f16`.
//!
//! ## Quick Start
//!
//! ```
//! use semdex_embed::{EmbeddingProvider, HashingProvider};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let provider = HashingProvider::new(384);
//! let texts = vec!["fn main() {}".to_string(), "def main(): pass".to_string()];
//! let result = provider.embed_texts(&texts).await?;
//! assert_eq!(result.dimension, 384);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod batch;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod provider;
pub mod rate_limit;

pub use backoff::Backoff;
pub use batch::{Batch, RetryAttempt};
pub use config::{HttpProviderConfig, PipelineConfig, ProviderLimits, RetryPolicy};
pub use error::{EmbedError, ProviderError, Result};
pub use pipeline::{
    BatchFailure, EmbedProgress, EmbeddedChunk, EmbeddingPipeline, PipelineOutput,
    ProgressCallback,
};
#[cfg(feature = "fastembed")]
pub use provider::FastEmbedProvider;
pub use provider::{EmbeddingProvider, EmbeddingResult, HashingProvider, HttpEmbeddingProvider};
pub use rate_limit::RateLimiter;
