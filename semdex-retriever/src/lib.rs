//! semdex-retriever: semantic indexing and search over a repository
//!
//! Files are analyzed and chunked by `semdex-context`, embedded by
//! `semdex-embed` and stored here as vector records that can be queried by
//! cosine similarity.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: the [`IndexManager`], processing jobs and the file stream
//! - **[`storage`]**: the vector record store and job persistence, both in SQLite
//! - **[`config`]**: [`IndexingEngineConfig`], loadable from TOML
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use semdex_retriever::{IndexManager, IndexingEngineConfig, JobType, QueryFilter};
//! use semdex_retriever::retrieval::source::discover;
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let root = Path::new(".");
//! let config = IndexingEngineConfig::new("my-project", root.to_path_buf());
//! let manager = IndexManager::from_config(config).await?;
//!
//! let repo = manager.register_repository(root, None, None).await?;
//! let files = discover(root, manager.config().max_file_bytes);
//! let job_id = manager.start_job(&repo.id, JobType::FullIndex, files).await?;
//! let job = manager.wait(job_id).await?;
//! println!("{} files indexed", job.progress.files_processed);
//!
//! for hit in manager.search_text("open the database", 5, &QueryFilter::default()).await? {
//!     println!("{:.3} {}:{}-{}", hit.score, hit.file, hit.line_range.0, hit.line_range.1);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SourceFile stream → Analyzer + Chunker → EmbeddingPipeline → VectorStore
//!                                 ↑                                ↓
//!                   IndexManager (jobs, JobStore)  ←  search / search_text
//! ```

pub mod config;
pub mod retrieval;
pub mod storage;

pub use config::{IndexingEngineConfig, ProviderConfig};
pub use retrieval::index_manager::{IndexManager, SearchResult};
pub use retrieval::job::{
    IndexSummary, JobControlError, JobError, JobProgress, JobStatus, JobType, ProcessingJob,
};
pub use retrieval::repository::RepositoryInfo;
pub use retrieval::source::SourceFile;
pub use storage::{QueryFilter, StoreError, StoreStats};
