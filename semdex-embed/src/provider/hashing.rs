use super::{EmbeddingProvider, EmbeddingResult, normalize_to_f16};
use crate::config::ProviderLimits;
use crate::error::Result;
use async_trait::async_trait;
use fnv::FnvHasher;
use std::hash::Hasher;

/// Deterministic offline provider based on signed feature hashing.
///
/// Every identifier in the text, plus its lower-cased `snake_case` and
/// `camelCase` parts, is hashed with FNV into one of `dimension` buckets.
/// The vectors carry no learned semantics but share buckets for shared
/// vocabulary, which is enough for tests, benchmarks and air-gapped use.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimension: usize,
    name: String,
    limits: ProviderLimits,
}

impl HashingProvider {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            name: format!("hashing-{dimension}"),
            limits: ProviderLimits::new(dimension).with_max_batch_items(128),
        }
    }

    pub fn with_limits(mut self, limits: ProviderLimits) -> Self {
        self.limits = ProviderLimits {
            output_dimensionality: self.dimension,
            ..limits
        };
        self
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for feature in features(text) {
            let mut hasher = FnvHasher::default();
            hasher.write(feature.as_bytes());
            let hash = hasher.finish();
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        vector
    }
}

fn features(text: &str) -> Vec<String> {
    let mut features = Vec::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
    {
        let lower = word.to_lowercase();
        let parts = split_identifier(word);
        if parts.len() > 1 {
            features.extend(parts);
        }
        features.push(lower);
    }
    features
}

/// `parseHttpRequest` and `parse_http_request` both become
/// `["parse", "http", "request"]`.
fn split_identifier(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut previous_lower = false;
    for c in word.chars() {
        if c == '_' {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            previous_lower = false;
            continue;
        }
        if c.is_uppercase() && previous_lower && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        previous_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let embeddings = texts
            .iter()
            .map(|text| normalize_to_f16(self.embed_one(text)))
            .collect();
        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> ProviderLimits {
        self.limits.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[half::f16], b: &[half::f16]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x.to_f32() * y.to_f32()).sum()
    }

    #[test]
    fn test_split_identifier() {
        assert_eq!(split_identifier("parseHttpRequest"), vec!["parse", "http", "request"]);
        assert_eq!(split_identifier("parse_http_request"), vec!["parse", "http", "request"]);
        assert_eq!(split_identifier("HTTP"), vec!["http"]);
    }

    #[tokio::test]
    async fn test_deterministic_and_normalized() -> anyhow::Result<()> {
        let provider = HashingProvider::new(64);
        let texts = vec![
            "fn connect_database(url: &str)".to_string(),
            "fn connect_database(url: &str)".to_string(),
            String::new(),
        ];
        let result = provider.embed_texts(&texts).await?;

        assert_eq!(result.dimension, 64);
        assert_eq!(result.embeddings[0], result.embeddings[1]);
        let norm = cosine(&result.embeddings[0], &result.embeddings[0]);
        assert!((norm - 1.0).abs() < 0.01, "{norm}");
        assert!(result.embeddings[2].iter().all(|v| v.to_f32() == 0.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_shared_vocabulary_scores_higher() -> anyhow::Result<()> {
        let provider = HashingProvider::new(256);
        let query = provider.embed_text("database connection pool").await?;
        let close = provider
            .embed_text("open a database connection from the pool")
            .await?;
        let far = provider.embed_text("render the settings window").await?;

        assert!(cosine(&query, &close) > cosine(&query, &far));
        assert_eq!(provider.provider_name(), "hashing-256");
        Ok(())
    }
}
