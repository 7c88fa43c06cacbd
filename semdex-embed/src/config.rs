//! Configuration for providers, retries and the embedding pipeline
//!
//! All structs deserialize with `#[serde(default)]`, so a TOML table only
//! needs to name the fields it changes:
//!
//! ```
//! use semdex_embed::PipelineConfig;
//!
//! let config: PipelineConfig = serde_json::from_str(r#"{"max_concurrent_batches": 2}"#).unwrap();
//! assert_eq!(config.max_concurrent_batches, 2);
//! assert_eq!(config.retry.max_attempts, 3);
//! ```

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits a provider declares for each call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderLimits {
    /// Upper bound on the summed token estimate of one batch
    pub max_batch_tokens: usize,
    /// Upper bound on the number of texts in one batch
    pub max_batch_items: usize,
    /// Length of every returned vector
    pub output_dimensionality: usize,
    /// Calls per minute; 0 disables rate limiting
    pub rate_per_minute: u32,
    /// Hard ceiling for a single input; longer inputs are truncated
    pub max_input_tokens: usize,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_batch_tokens: 8192,
            max_batch_items: 64,
            output_dimensionality: 384,
            rate_per_minute: 0,
            max_input_tokens: 8192,
        }
    }
}

impl ProviderLimits {
    pub fn new(output_dimensionality: usize) -> Self {
        Self {
            output_dimensionality,
            ..Self::default()
        }
    }

    pub fn with_max_batch_tokens(mut self, max_batch_tokens: usize) -> Self {
        self.max_batch_tokens = max_batch_tokens;
        self
    }

    pub fn with_max_batch_items(mut self, max_batch_items: usize) -> Self {
        self.max_batch_items = max_batch_items;
        self
    }

    pub fn with_rate_per_minute(mut self, rate_per_minute: u32) -> Self {
        self.rate_per_minute = rate_per_minute;
        self
    }

    pub fn with_max_input_tokens(mut self, max_input_tokens: usize) -> Self {
        self.max_input_tokens = max_input_tokens;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_tokens == 0 || self.max_batch_items == 0 {
            return Err(EmbedError::invalid_config(
                "max_batch_tokens and max_batch_items must be positive",
            ));
        }
        if self.max_input_tokens == 0 {
            return Err(EmbedError::invalid_config("max_input_tokens must be positive"));
        }
        if self.output_dimensionality == 0 {
            return Err(EmbedError::invalid_config(
                "output_dimensionality must be positive",
            ));
        }
        Ok(())
    }
}

/// Exponential backoff settings for retryable provider failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total calls per batch, including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Upper bound of the random stretch applied to each delay (0.1 = up to +10%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Settings for [`crate::EmbeddingPipeline`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    /// Batches allowed in flight at once
    pub max_concurrent_batches: usize,
    /// Deadline for a single provider call
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent_batches: 4,
            request_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_concurrent_batches(mut self, max_concurrent_batches: usize) -> Self {
        self.max_concurrent_batches = max_concurrent_batches;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Settings for [`crate::HttpEmbeddingProvider`], an OpenAI-compatible
/// `/embeddings` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProviderConfig {
    /// Base URL without the `/embeddings` suffix
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the bearer token
    pub api_key_env: Option<String>,
    pub request_timeout_secs: u64,
    pub limits: ProviderLimits,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            request_timeout_secs: 30,
            limits: ProviderLimits::new(1536)
                .with_max_batch_items(256)
                .with_rate_per_minute(3000),
        }
    }
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            limits: ProviderLimits::new(dimension),
            ..Self::default()
        }
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    pub fn without_api_key(mut self) -> Self {
        self.api_key_env = None;
        self
    }

    pub fn with_limits(mut self, limits: ProviderLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(EmbedError::invalid_config("base_url must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(EmbedError::invalid_config("model must not be empty"));
        }
        if self.request_timeout_secs == 0 {
            return Err(EmbedError::invalid_config("request_timeout_secs must be at least 1"));
        }
        self.limits.validate()
    }
}
