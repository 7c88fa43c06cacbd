use super::{EmbeddingProvider, EmbeddingResult, normalize_to_f16};
use crate::config::{HttpProviderConfig, ProviderLimits};
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// Provider for any OpenAI-compatible `POST {base_url}/embeddings` endpoint
/// (OpenAI, Ollama, vLLM, text-embeddings-inference, ...).
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    config: HttpProviderConfig,
    api_key: Option<String>,
    client: Client,
    name: String,
}

impl HttpEmbeddingProvider {
    /// Build the provider, reading the API key from `config.api_key_env`.
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        config.validate()?;
        let api_key = match &config.api_key_env {
            Some(var) => {
                let key = std::env::var(var).ok().filter(|k| !k.trim().is_empty());
                if key.is_none() {
                    tracing::warn!(var = %var, "API key variable is not set, sending unauthenticated requests");
                }
                key
            }
            None => None,
        };
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EmbedError::invalid_config(format!("failed to build HTTP client: {e}")))?;
        let name = format!("http:{}", config.model);

        Ok(Self {
            config,
            api_key,
            client,
            name,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.config.base_url.trim_end_matches('/'))
    }

    async fn fetch_embeddings(&self, texts: &[String]) -> Result<EmbeddingsResponse> {
        let payload = serde_json::json!({
            "input": texts,
            "model": self.config.model,
            "encoding_format": "float",
        });

        let mut request = self.client.post(self.endpoint()).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EmbedError::Timeout {
                    after: self.config.request_timeout(),
                }
            } else {
                EmbedError::Transport {
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(512).collect();
            return Err(EmbedError::from_status(status.as_u16(), message));
        }

        response
            .json::<EmbeddingsResponse>()
            .await
            .map_err(|e| EmbedError::malformed(e.to_string()))
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        tracing::debug!(count = texts.len(), endpoint = %self.endpoint(), "requesting embeddings");
        let mut data = self.fetch_embeddings(texts).await?.data;

        if data.len() != texts.len() {
            return Err(EmbedError::malformed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                data.len()
            )));
        }
        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
        }

        let expected = self.embedding_dimension();
        let mut embeddings = Vec::with_capacity(data.len());
        for datum in data {
            if datum.embedding.len() != expected {
                return Err(EmbedError::DimensionMismatch {
                    expected,
                    actual: datum.embedding.len(),
                });
            }
            embeddings.push(normalize_to_f16(datum.embedding));
        }
        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.config.limits.output_dimensionality
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> ProviderLimits {
        self.config.limits.clone()
    }
}
