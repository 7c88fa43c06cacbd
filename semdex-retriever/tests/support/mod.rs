//! Shared fixtures: a repository on disk and providers with scripted behavior.

#![allow(dead_code)]

use async_trait::async_trait;
use semdex_embed::{
    EmbedError, EmbeddingProvider, EmbeddingResult, HashingProvider, PipelineConfig,
    ProviderLimits, RetryPolicy,
};
use semdex_retriever::retrieval::source::discover;
use semdex_retriever::{
    IndexManager, IndexingEngineConfig, JobStatus, JobType, ProcessingJob, RepositoryInfo,
    SourceFile,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

pub const DIMENSION: usize = 32;

pub fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Three small files in three languages.
pub fn sample_repo(root: &Path) {
    write(
        root,
        "src/lib.rs",
        "use std::fmt;\n\npub fn parse_config(path: &str) -> String {\n    path.to_string()\n}\n\npub fn render_page(title: &str) -> String {\n    format!(\"<h1>{title}</h1>\")\n}\n",
    );
    write(
        root,
        "tools/report.py",
        "import os\n\n\ndef build_report(rows):\n    return len(rows)\n\n\ndef send_report(report):\n    print(report)\n",
    );
    write(
        root,
        "web/app.js",
        "function hello(name) { return \"Hello, \" + name; }\n",
    );
}

/// Fast retries so failure tests do not sleep for long.
pub fn fast_pipeline(max_attempts: u32, concurrency: usize) -> PipelineConfig {
    PipelineConfig::default()
        .with_max_concurrent_batches(concurrency)
        .with_request_timeout(Duration::from_secs(5))
        .with_retry(
            RetryPolicy::default()
                .with_max_attempts(max_attempts)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(20))
                .with_jitter(0.0),
        )
}

pub async fn open(
    root: &Path,
    pipeline: PipelineConfig,
    provider: Arc<dyn EmbeddingProvider>,
) -> anyhow::Result<(IndexManager, RepositoryInfo)> {
    let config = IndexingEngineConfig::new("fixture", root.to_path_buf())
        .with_max_workers(2)
        .with_pipeline(pipeline);
    let manager = IndexManager::open(config, provider).await?;
    let repo = manager.register_repository(root, None, None).await?;
    Ok((manager, repo))
}

pub async fn run_job(
    manager: &IndexManager,
    repo: &RepositoryInfo,
    job_type: JobType,
    files: Vec<SourceFile>,
) -> anyhow::Result<ProcessingJob> {
    let id = manager.start_job(&repo.id, job_type, files).await?;
    Ok(manager.wait(id).await?)
}

pub async fn full_index(manager: &IndexManager, repo: &RepositoryInfo, root: &Path) -> anyhow::Result<ProcessingJob> {
    let job = run_job(manager, repo, JobType::FullIndex, discover(root, u64::MAX)).await?;
    assert_eq!(job.status, JobStatus::Completed, "{job:#?}");
    Ok(job)
}

/// Poll the job until `done` holds, failing after five seconds.
pub async fn wait_for_progress(
    manager: &IndexManager,
    id: Uuid,
    done: impl Fn(&ProcessingJob) -> bool,
) -> anyhow::Result<ProcessingJob> {
    let poll = async {
        loop {
            let job = manager.get_job(id).await?;
            if done(&job) {
                return anyhow::Ok(job);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .map_err(|_| anyhow::anyhow!("job {id} did not reach the expected state"))?
}

/// Hashing vectors, one chunk per batch, with failures for marked texts.
pub struct ScriptedProvider {
    inner: HashingProvider,
    name: String,
    failure: Option<(&'static str, u16)>,
    pub calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            inner: HashingProvider::new(DIMENSION),
            name: name.to_string(),
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail every call whose texts contain `marker` with HTTP `status`.
    pub fn failing_on(mut self, marker: &'static str, status: u16) -> Self {
        self.failure = Some((marker, status));
        self
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    async fn embed_texts(&self, texts: &[String]) -> semdex_embed::Result<EmbeddingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((marker, status)) = self.failure {
            if texts.iter().any(|t| t.contains(marker)) {
                return Err(EmbedError::from_status(status, "scripted failure"));
            }
        }
        self.inner.embed_texts(texts).await
    }

    fn embedding_dimension(&self) -> usize {
        DIMENSION
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits::new(DIMENSION).with_max_batch_items(1)
    }
}

/// Blocks its first call until released.
pub struct GatedProvider {
    inner: HashingProvider,
    gated: AtomicBool,
    pub started: Notify,
    pub release: Notify,
    pub calls: AtomicUsize,
}

impl GatedProvider {
    pub fn new() -> Self {
        Self {
            inner: HashingProvider::new(DIMENSION),
            gated: AtomicBool::new(true),
            started: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for GatedProvider {
    async fn embed_texts(&self, texts: &[String]) -> semdex_embed::Result<EmbeddingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.gated.swap(false, Ordering::SeqCst) {
            self.started.notify_one();
            self.release.notified().await;
        }
        self.inner.embed_texts(texts).await
    }

    fn embedding_dimension(&self) -> usize {
        DIMENSION
    }

    fn provider_name(&self) -> &str {
        "gated"
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits::new(DIMENSION).with_max_batch_items(1)
    }
}
