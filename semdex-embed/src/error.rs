//! Error types for embedding providers and the embedding pipeline

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// How the pipeline should react to a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderError {
    /// Worth another attempt after a backoff delay
    Retryable,
    /// Retrying cannot help; no new batches should be launched
    Fatal,
}

/// Error type for all embedding operations.
///
/// Every variant maps onto a [`ProviderError`] class through
/// [`EmbedError::classify`]. Timeouts, rate limiting, server-side failures
/// and transport problems are retryable. Authentication failures, rejected
/// requests, malformed responses and dimension mismatches are fatal.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when provider configuration is invalid
    #[error("Invalid provider configuration: {message}")]
    InvalidConfig { message: String },

    /// The provider asked us to slow down (HTTP 429 or equivalent)
    #[error("Rate limited by provider: {message}")]
    RateLimited { message: String },

    /// Server-side failure (HTTP 5xx or equivalent)
    #[error("Provider unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    /// The request never produced a response
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The provider call exceeded its deadline
    #[error("Provider call timed out after {after:?}")]
    Timeout { after: Duration },

    /// Authentication failure or malformed request (HTTP 4xx)
    #[error("Request rejected by provider ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response could not be understood
    #[error("Malformed provider response: {message}")]
    MalformedResponse { message: String },

    /// A vector did not have the provider's declared dimensionality
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Error during local model initialization
    #[error("Model initialization failed: {source}")]
    ModelInitialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Whether the failure is worth retrying.
    pub fn classify(&self) -> ProviderError {
        match self {
            Self::RateLimited { .. }
            | Self::Unavailable { .. }
            | Self::Transport { .. }
            | Self::Timeout { .. } => ProviderError::Retryable,
            Self::InvalidConfig { .. }
            | Self::Rejected { .. }
            | Self::MalformedResponse { .. }
            | Self::DimensionMismatch { .. }
            | Self::ModelInitialization { .. }
            | Self::AsyncTask { .. }
            | Self::External { .. } => ProviderError::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() == ProviderError::Retryable
    }

    /// Map an HTTP status to the matching variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited { message },
            408 => Self::Transport { message },
            500..=599 => Self::Unavailable { status, message },
            _ => Self::Rejected { status, message },
        }
    }

    /// Create a model initialization error from any error type.
    pub fn model_init<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ModelInitialization {
            source: Box::new(source),
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }
}
