//! Configuration for the index operator.
//!
//! Every section can be given in a TOML file; omitted keys keep their
//! defaults:
//!
//! ```toml
//! repository = "my-project"
//! base_path = "."
//! max_workers = 8
//!
//! [chunker]
//! max_tokens = 256
//!
//! [pipeline]
//! max_concurrent_batches = 2
//!
//! [provider]
//! kind = "http"
//! base_url = "http://localhost:8080/v1"
//! model = "nomic-embed-text"
//! api_key_env = "EMBED_API_KEY"
//! ```

use anyhow::{Context, Result};
use semdex_context::analyzer::flow::{FlowAnalyzer, FlowAnalyzerConfig};
use semdex_context::language::FLOW;
use semdex_context::{AnalyzerRegistry, ChunkerConfig};
use semdex_embed::{
    EmbeddingProvider, HashingProvider, HttpEmbeddingProvider, HttpProviderConfig, PipelineConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn default_hashing_dimension() -> usize {
    384
}

/// Which embedding provider a job uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Offline feature hashing
    Hashing {
        #[serde(default = "default_hashing_dimension")]
        dimension: usize,
    },
    /// OpenAI-compatible HTTP endpoint
    Http(HttpProviderConfig),
    /// Local ONNX model
    #[cfg(feature = "fastembed")]
    Fastembed {
        #[serde(default)]
        cache_dir: Option<PathBuf>,
    },
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::Hashing {
            dimension: default_hashing_dimension(),
        }
    }
}

impl ProviderConfig {
    pub async fn build(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        let provider: Arc<dyn EmbeddingProvider> = match self {
            Self::Hashing { dimension } => {
                anyhow::ensure!(*dimension > 0, "hashing dimension must be positive");
                Arc::new(HashingProvider::new(*dimension))
            }
            Self::Http(config) => Arc::new(
                HttpEmbeddingProvider::new(config.clone())
                    .context("Failed to configure HTTP embedding provider")?,
            ),
            #[cfg(feature = "fastembed")]
            Self::Fastembed { cache_dir } => Arc::new(
                semdex_embed::FastEmbedProvider::create(cache_dir.clone())
                    .await
                    .context("Failed to load local embedding model")?,
            ),
        };
        Ok(provider)
    }
}

/// Configuration for the indexing engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingEngineConfig {
    /// Repository name stamped on every chunk
    pub repository: String,
    /// Root directory of the repository
    pub base_path: PathBuf,
    /// Where the index lives; defaults to `<base_path>/.semdex`
    pub index_dir: Option<PathBuf>,
    /// Files analyzed concurrently
    pub max_workers: usize,
    /// Files larger than this are not indexed
    pub max_file_bytes: u64,
    pub chunker: ChunkerConfig,
    pub flow: FlowAnalyzerConfig,
    pub pipeline: PipelineConfig,
    pub provider: ProviderConfig,
}

impl Default for IndexingEngineConfig {
    fn default() -> Self {
        Self::new("repository", PathBuf::from("."))
    }
}

impl IndexingEngineConfig {
    pub fn new(repository: impl Into<String>, base_path: PathBuf) -> Self {
        let repository = repository.into();
        Self {
            chunker: ChunkerConfig::new(repository.clone()),
            repository,
            base_path,
            index_dir: None,
            max_workers: 4,
            max_file_bytes: 1024 * 1024,
            flow: FlowAnalyzerConfig::default(),
            pipeline: PipelineConfig::default(),
            provider: ProviderConfig::default(),
        }
    }

    pub fn with_index_dir(mut self, index_dir: PathBuf) -> Self {
        self.index_dir = Some(index_dir);
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_flow(mut self, flow: FlowAnalyzerConfig) -> Self {
        self.flow = flow;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = provider;
        self
    }

    pub fn index_dir(&self) -> PathBuf {
        self.index_dir
            .clone()
            .unwrap_or_else(|| self.base_path.join(".semdex"))
    }

    /// Built-in analyzers, with the flow analyzer using [`Self::flow`].
    pub fn analyzer_registry(&self) -> AnalyzerRegistry {
        let mut registry = AnalyzerRegistry::with_defaults();
        registry.register(FLOW, Arc::new(FlowAnalyzer::new(self.flow.clone())));
        registry
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_workers > 0, "max_workers must be at least 1");
        anyhow::ensure!(
            self.pipeline.max_concurrent_batches > 0,
            "pipeline.max_concurrent_batches must be at least 1"
        );
        anyhow::ensure!(
            self.pipeline.retry.max_attempts > 0,
            "pipeline.retry.max_attempts must be at least 1"
        );
        anyhow::ensure!(
            self.pipeline.request_timeout_secs > 0,
            "pipeline.request_timeout_secs must be at least 1"
        );
        anyhow::ensure!(self.chunker.max_tokens > 0, "chunker.max_tokens must be positive");
        if let ProviderConfig::Http(http) = &self.provider {
            http.validate()?;
        }
        Ok(())
    }

    /// Parse a TOML document. The chunker's repository defaults to [`Self::repository`].
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: toml::Value = toml::from_str(text).context("Invalid TOML")?;
        let chunker_repo_given = raw
            .get("chunker")
            .and_then(|chunker| chunker.get("repo"))
            .is_some();

        let mut config: Self = raw.try_into().context("Invalid indexing configuration")?;
        if !chunker_repo_given {
            config.chunker.repo = config.repository.clone();
        }
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("Failed to load {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IndexingEngineConfig::new("demo", PathBuf::from("/work/demo"));
        assert_eq!(config.index_dir(), PathBuf::from("/work/demo/.semdex"));
        assert_eq!(config.chunker.repo, "demo");
        assert_eq!(config.provider, ProviderConfig::Hashing { dimension: 384 });
        assert!(config.validate().is_ok());

        let moved = config.with_index_dir(PathBuf::from("/tmp/idx"));
        assert_eq!(moved.index_dir(), PathBuf::from("/tmp/idx"));
    }

    #[test]
    fn test_from_toml() -> Result<()> {
        let config = IndexingEngineConfig::from_toml_str(
            r#"
            repository = "shop"
            base_path = "/srv/shop"
            max_workers = 2

            [chunker]
            max_tokens = 128

            [pipeline]
            max_concurrent_batches = 1

            [pipeline.retry]
            max_attempts = 5

            [provider]
            kind = "http"
            base_url = "http://localhost:9000/v1"
            model = "mini"
            api_key_env = "EMBED_KEY"

            [provider.limits]
            output_dimensionality = 256
            "#,
        )?;

        assert_eq!(config.repository, "shop");
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.chunker.max_tokens, 128);
        assert_eq!(config.chunker.repo, "shop");
        assert_eq!(config.chunker.context_lines, 3);
        assert_eq!(config.pipeline.max_concurrent_batches, 1);
        assert_eq!(config.pipeline.retry.max_attempts, 5);
        let ProviderConfig::Http(http) = &config.provider else {
            panic!("expected http provider, got {:?}", config.provider);
        };
        assert_eq!(http.model, "mini");
        assert_eq!(http.limits.output_dimensionality, 256);
        Ok(())
    }

    #[test]
    fn test_hashing_dimension_default() -> Result<()> {
        let config = IndexingEngineConfig::from_toml_str("[provider]\nkind = \"hashing\"\n")?;
        assert_eq!(config.provider, ProviderConfig::Hashing { dimension: 384 });
        Ok(())
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(IndexingEngineConfig::from_toml_str("max_workers = \"many\"").is_err());
        assert!(IndexingEngineConfig::default().with_max_workers(0).validate().is_err());
    }

    #[test]
    fn test_zero_request_timeout_rejected() -> Result<()> {
        let config = IndexingEngineConfig::from_toml_str(
            r#"
            repository = "shop"
            base_path = "/srv/shop"

            [pipeline]
            request_timeout_secs = 0
            "#,
        )?;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout_secs"));
        Ok(())
    }

    #[tokio::test]
    async fn test_build_hashing_provider() -> Result<()> {
        let provider = ProviderConfig::Hashing { dimension: 32 }.build().await?;
        assert_eq!(provider.embedding_dimension(), 32);
        assert!(ProviderConfig::Hashing { dimension: 0 }.build().await.is_err());
        Ok(())
    }
}
