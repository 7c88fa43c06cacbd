//! Orchestration of indexing jobs.
//!
//! The [`IndexManager`] owns the job state machine and drives files through
//! analysis, chunking, embedding and storage:
//!
//! ```text
//! SourceFile ─► spawn_blocking(chunk_source) ─► round of chunks ─► EmbeddingPipeline ─► VectorStore
//!                 (max_workers in parallel)      (≈ one round of batches)
//! ```
//!
//! Jobs run on their own tokio task. Cancellation and pause are checked
//! between files and between rounds; a batch already sent to the provider is
//! always allowed to finish. Job state is persisted at every transition and
//! after every file, and jobs left active by a previous process are marked
//! failed with the `interrupted` code when the index is opened.

use super::job::{
    IndexSummary, JobControlError, JobError, JobProgress, JobStatus, JobType, ProcessingJob,
};
use super::repository::RepositoryInfo;
use super::source::SourceFile;
use crate::config::IndexingEngineConfig;
use crate::storage::{
    JobStore, NewRecord, QueryFilter, StoreError, StoreStats, VectorRecord, VectorStore,
    fingerprint, open_pool,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use half::f16;
use semdex_context::{AnalyzerRegistry, ChunkType, Chunker, TextChunk, chunk_source};
use semdex_embed::{
    EmbedProgress, EmbeddingPipeline, EmbeddingProvider, PipelineOutput, ProviderError,
    RateLimiter,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One hit of [`IndexManager::search`].
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub score: f32,
    pub id: String,
    pub file: String,
    pub repo: String,
    pub line_range: (usize, usize),
    /// Chunk content with its surrounding context lines
    pub context: String,
    pub language: String,
    pub chunk_type: ChunkType,
    pub names: Vec<String>,
    pub relevance_explanation: String,
}

impl SearchResult {
    fn new(score: f32, id: String, chunk: TextChunk) -> Self {
        let names = chunk.names();
        let subject = match names.first() {
            Some(name) => format!("{} `{}`", chunk.chunk_type, name),
            None => chunk.chunk_type.to_string(),
        };
        let relevance_explanation = format!(
            "{subject} in {} (lines {}) has cosine similarity {score:.3} to the query",
            chunk.relative_path,
            chunk.line_range()
        );

        let mut context = chunk.context_before.clone();
        context.push(chunk.content.clone());
        context.extend(chunk.context_after.iter().cloned());

        Self {
            score,
            id,
            line_range: (chunk.start_line, chunk.end_line),
            context: context.join("\n"),
            names,
            relevance_explanation,
            file: chunk.relative_path,
            repo: chunk.repo,
            language: chunk.language,
            chunk_type: chunk.chunk_type,
        }
    }
}

/// Why a running job stopped early.
enum Abort {
    Cancelled,
    Fatal(JobError),
}

impl Abort {
    fn store(error: StoreError) -> Self {
        Self::Fatal(JobError::new(error.code(), &error, false))
    }
}

enum FileOutcome {
    Analyzed(AnalyzedFile),
    Missing(SourceFile),
    Skipped(JobError),
}

impl FileOutcome {
    fn skipped(file: &SourceFile, code: &str, message: impl ToString) -> Self {
        Self::Skipped(JobError::new(code, message, false).with_file(&file.relative_path))
    }
}

struct AnalyzedFile {
    source: SourceFile,
    chunks: Vec<TextChunk>,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundMode {
    /// Reuse stored chunks, then drop records the file no longer produces
    Index,
    /// Invalidate each file before embedding it
    Reindex,
    /// Replace vectors of existing records; nothing is removed
    Migrate,
}

#[derive(Default)]
struct FileTally {
    keep: HashSet<String>,
    embedded: usize,
    reused: usize,
    truncated: bool,
    failed: bool,
}

#[derive(Clone)]
struct JobHandle {
    id: Uuid,
    job: Arc<RwLock<ProcessingJob>>,
    provider: Arc<dyn EmbeddingProvider>,
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    status: Arc<watch::Sender<JobStatus>>,
}

struct Inner {
    config: IndexingEngineConfig,
    registry: AnalyzerRegistry,
    chunker: Chunker,
    store: VectorStore,
    jobs: JobStore,
    providers: DashMap<String, Arc<dyn EmbeddingProvider>>,
    default_provider: String,
    /// One quota per provider name, shared by every round of every job
    limiters: DashMap<String, Arc<RateLimiter>>,
    active: DashMap<Uuid, JobHandle>,
}

/// Entry point for indexing jobs and queries over one index directory.
#[derive(Clone)]
pub struct IndexManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("index_dir", &self.inner.store.index_dir())
            .field("default_provider", &self.inner.default_provider)
            .field("active_jobs", &self.inner.active.len())
            .finish()
    }
}

impl IndexManager {
    /// Open the index at `config.index_dir()` with `provider` as the default provider.
    pub async fn open(config: IndexingEngineConfig, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        config.validate()?;
        let index_dir = config.index_dir();
        info!(
            repository = %config.repository,
            index_dir = %index_dir.display(),
            provider = provider.provider_name(),
            "Opening index"
        );

        let pool = open_pool(&index_dir)
            .await
            .context("Failed to open index database")?;
        let store = VectorStore::with_pool(&index_dir, pool.clone()).await?;
        let jobs = JobStore::new(pool).await?;
        for job_id in jobs.mark_interrupted().await? {
            warn!(job_id = %job_id, "job was interrupted by a restart and is now failed");
        }

        let default_provider = provider.provider_name().to_string();
        let providers = DashMap::new();
        providers.insert(default_provider.clone(), provider);

        Ok(Self {
            inner: Arc::new(Inner {
                registry: config.analyzer_registry(),
                chunker: Chunker::new(config.chunker.clone()),
                config,
                store,
                jobs,
                providers,
                default_provider,
                limiters: DashMap::new(),
                active: DashMap::new(),
            }),
        })
    }

    /// Open the index with the provider described by `config.provider`.
    pub async fn from_config(config: IndexingEngineConfig) -> Result<Self> {
        let provider = config.provider.build().await?;
        Self::open(config, provider).await
    }

    pub fn config(&self) -> &IndexingEngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &VectorStore {
        &self.inner.store
    }

    /// Make another provider selectable by name for jobs.
    pub fn register_provider(&self, provider: Arc<dyn EmbeddingProvider>) {
        let name = provider.provider_name().to_string();
        self.inner.limiters.remove(&name);
        self.inner.providers.insert(name, provider);
    }

    pub fn provider(&self, name: Option<&str>) -> Result<Arc<dyn EmbeddingProvider>, JobControlError> {
        self.inner.provider(name)
    }

    pub async fn register_repository(
        &self,
        path: &Path,
        remote_url: Option<String>,
        branch: Option<String>,
    ) -> Result<RepositoryInfo, JobControlError> {
        let repository = RepositoryInfo::new(path, remote_url, branch);
        let stored = self.inner.jobs.upsert_repository(&repository).await?;
        debug!(repository_id = %stored.id, path = %stored.path.display(), "repository registered");
        Ok(stored)
    }

    pub async fn repositories(&self) -> Result<Vec<RepositoryInfo>, JobControlError> {
        Ok(self.inner.jobs.list_repositories().await?)
    }

    /// Start a job with the default provider. `files` is ignored by job
    /// types that do not consume a file stream.
    pub async fn start_job(
        &self,
        repository_id: &str,
        job_type: JobType,
        files: Vec<SourceFile>,
    ) -> Result<Uuid, JobControlError> {
        self.start_job_with_provider(repository_id, job_type, files, None)
            .await
    }

    pub async fn start_job_with_provider(
        &self,
        repository_id: &str,
        job_type: JobType,
        files: Vec<SourceFile>,
        provider: Option<&str>,
    ) -> Result<Uuid, JobControlError> {
        if self.inner.jobs.touch_repository(repository_id).await?.is_none() {
            return Err(JobControlError::UnknownRepository(repository_id.to_string()));
        }
        let provider = self.inner.provider(provider)?;

        let job = ProcessingJob::new(repository_id, job_type, provider.provider_name());
        let id = job.id;
        self.inner.jobs.save_job(&job).await?;
        info!(job_id = %id, job_type = %job_type, files = files.len(), provider = %job.provider, "job created");

        let handle = JobHandle {
            id,
            job: Arc::new(RwLock::new(job)),
            provider,
            cancel: CancellationToken::new(),
            paused: Arc::new(watch::channel(false).0),
            status: Arc::new(watch::channel(JobStatus::Pending).0),
        };
        self.inner.active.insert(id, handle.clone());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_job(handle, files).await });
        Ok(id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<ProcessingJob, JobControlError> {
        if let Some(handle) = self.inner.handle(job_id) {
            return Ok(handle.job.read().await.clone());
        }
        self.inner
            .jobs
            .load_job(job_id)
            .await?
            .ok_or(JobControlError::UnknownJob(job_id))
    }

    pub async fn get_progress(&self, job_id: Uuid) -> Result<JobProgress, JobControlError> {
        Ok(self.get_job(job_id).await?.progress)
    }

    /// Jobs in creation order, optionally for one repository.
    pub async fn list_jobs(&self, repository_id: Option<&str>) -> Result<Vec<ProcessingJob>, JobControlError> {
        let mut jobs = self.inner.jobs.list_jobs(repository_id).await?;
        for job in &mut jobs {
            if let Some(handle) = self.inner.handle(job.id) {
                *job = handle.job.read().await.clone();
            }
        }
        Ok(jobs)
    }

    /// Request cancellation. A running job stops at its next checkpoint.
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), JobControlError> {
        if let Some(handle) = self.inner.handle(job_id) {
            let status = handle.job.read().await.status;
            if !status.can_transition_to(JobStatus::Cancelled) {
                return Err(JobControlError::InvalidTransition {
                    job_id,
                    from: status,
                    to: JobStatus::Cancelled,
                });
            }
            info!(job_id = %job_id, "cancellation requested");
            handle.cancel.cancel();
            return Ok(());
        }

        // A pending job left behind by an earlier process has no worker.
        let mut job = self
            .inner
            .jobs
            .load_job(job_id)
            .await?
            .ok_or(JobControlError::UnknownJob(job_id))?;
        job.transition(JobStatus::Cancelled)?;
        self.inner.jobs.save_job(&job).await?;
        info!(job_id = %job_id, "job cancelled");
        Ok(())
    }

    pub async fn pause(&self, job_id: Uuid) -> Result<(), JobControlError> {
        let handle = self.inner.require_handle(job_id, JobStatus::Paused).await?;
        self.inner.transition(&handle, JobStatus::Paused).await?;
        handle.paused.send_replace(true);
        Ok(())
    }

    pub async fn resume(&self, job_id: Uuid) -> Result<(), JobControlError> {
        let handle = self.inner.require_handle(job_id, JobStatus::Running).await?;
        self.inner.transition(&handle, JobStatus::Running).await?;
        handle.paused.send_replace(false);
        Ok(())
    }

    /// Wait until the job reaches a terminal state and return it.
    pub async fn wait(&self, job_id: Uuid) -> Result<ProcessingJob, JobControlError> {
        if let Some(handle) = self.inner.handle(job_id) {
            let mut status = handle.status.subscribe();
            let _ = status.wait_for(|s| s.is_terminal()).await;
        }
        self.get_job(job_id).await
    }

    /// Top `k` chunks for an already computed query vector.
    pub async fn search(&self, vector: &[f16], k: usize, filter: &QueryFilter) -> Result<Vec<SearchResult>> {
        let hits = self.inner.store.query(vector, k, filter).await?;
        Ok(hits
            .into_iter()
            .map(|hit| SearchResult::new(hit.score, hit.record.id, hit.chunk))
            .collect())
    }

    /// Embed `query` with the default provider, then [`Self::search`].
    pub async fn search_text(&self, query: &str, k: usize, filter: &QueryFilter) -> Result<Vec<SearchResult>> {
        let provider = self.inner.provider(None)?;
        let vector = provider
            .embed_text(query)
            .await
            .context("Failed to embed query")?;
        self.search(&vector, k, filter).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        Ok(self.inner.store.stats().await?)
    }
}

impl Inner {
    /// The rate limiter for `provider`, created on first use. `None` when the
    /// provider declares no rate.
    fn limiter(&self, provider: &dyn EmbeddingProvider) -> Option<Arc<RateLimiter>> {
        let name = provider.provider_name();
        if let Some(limiter) = self.limiters.get(name) {
            return Some(Arc::clone(limiter.value()));
        }
        let limiter = Arc::new(RateLimiter::per_minute(provider.limits().rate_per_minute)?);
        Some(Arc::clone(
            self.limiters.entry(name.to_string()).or_insert(limiter).value(),
        ))
    }

    fn handle(&self, job_id: Uuid) -> Option<JobHandle> {
        self.active.get(&job_id).map(|entry| entry.value().clone())
    }

    /// The active handle, or the error a finished or unknown job produces for `next`.
    async fn require_handle(&self, job_id: Uuid, next: JobStatus) -> Result<JobHandle, JobControlError> {
        if let Some(handle) = self.handle(job_id) {
            return Ok(handle);
        }
        match self.jobs.load_job(job_id).await? {
            Some(job) => Err(JobControlError::InvalidTransition {
                job_id,
                from: job.status,
                to: next,
            }),
            None => Err(JobControlError::UnknownJob(job_id)),
        }
    }

    fn provider(&self, name: Option<&str>) -> Result<Arc<dyn EmbeddingProvider>, JobControlError> {
        let name = name.unwrap_or(&self.default_provider);
        self.providers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| JobControlError::UnknownProvider(name.to_string()))
    }

    async fn save(&self, job: &ProcessingJob) {
        if let Err(e) = self.jobs.save_job(job).await {
            error!(job_id = %job.id, error = %e, "failed to persist job");
        }
    }

    async fn transition(&self, handle: &JobHandle, next: JobStatus) -> Result<(), JobControlError> {
        let snapshot = {
            let mut job = handle.job.write().await;
            let from = job.status;
            job.transition(next)?;
            info!(job_id = %job.id, job_type = %job.job_type, from = %from, to = %next, "job transition");
            job.clone()
        };
        self.save(&snapshot).await;
        handle.status.send_replace(next);
        Ok(())
    }

    /// Apply `f` to the job, refresh its progress figures and persist it.
    async fn update(&self, handle: &JobHandle, f: impl FnOnce(&mut ProcessingJob) + Send) {
        let snapshot = {
            let mut job = handle.job.write().await;
            f(&mut job);
            let elapsed = job.elapsed_secs();
            job.progress.refresh(elapsed);
            job.updated_at = Utc::now();
            job.clone()
        };
        self.save(&snapshot).await;
    }

    /// Stop on cancellation; block while paused.
    async fn checkpoint(&self, handle: &JobHandle) -> Result<(), Abort> {
        let mut paused = handle.paused.subscribe();
        loop {
            if handle.cancel.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            let is_paused = *paused.borrow_and_update();
            if !is_paused {
                return Ok(());
            }
            debug!(job_id = %handle.id, "job paused at checkpoint");
            tokio::select! {
                _ = handle.cancel.cancelled() => return Err(Abort::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn run_job(self: Arc<Self>, handle: JobHandle, files: Vec<SourceFile>) {
        let job_type = handle.job.read().await.job_type;

        let result = if handle.cancel.is_cancelled() {
            Err(Abort::Cancelled)
        } else {
            match self.transition(&handle, JobStatus::Running).await {
                Ok(()) => self.execute(&handle, job_type, files).await,
                Err(e) => Err(Abort::Fatal(JobError::new("invalid_transition", e, false))),
            }
        };
        let result = match result {
            Ok(()) => self.checkpoint(&handle).await,
            aborted => aborted,
        };

        self.finish(&handle, result).await;
        self.active.remove(&handle.id);
    }

    async fn execute(self: &Arc<Self>, handle: &JobHandle, job_type: JobType, files: Vec<SourceFile>) -> Result<(), Abort> {
        match job_type {
            JobType::FullIndex => self.index_files(handle, files, RoundMode::Index).await,
            JobType::IncrementalUpdate => self.index_files(handle, files, RoundMode::Reindex).await,
            JobType::SummaryGeneration => self.summarize(handle).await,
            JobType::ProviderMigration => self.migrate(handle).await,
            JobType::Cleanup => self.cleanup(handle, files).await,
        }
    }

    async fn finish(&self, handle: &JobHandle, result: Result<(), Abort>) {
        let snapshot = {
            let mut job = handle.job.write().await;
            let from = job.status;
            let cancelled = matches!(result, Err(Abort::Cancelled));
            if from == JobStatus::Paused && !cancelled {
                // Paused after the last checkpoint; there is nothing left to wait for.
                let _ = job.transition(JobStatus::Running);
            }

            job.progress.current_step = "finished".to_string();
            let elapsed = job.elapsed_secs();
            job.progress.refresh(elapsed);

            let outcome = match result {
                Ok(()) => job.transition(JobStatus::Completed),
                Err(Abort::Cancelled) => job.transition(JobStatus::Cancelled),
                Err(Abort::Fatal(error)) => {
                    error!(job_id = %job.id, code = %error.code, error = %error.message, "job failed");
                    job.fail(error)
                }
            };
            if let Err(e) = outcome {
                error!(job_id = %job.id, error = %e, "could not finish job");
            }

            info!(
                job_id = %job.id,
                job_type = %job.job_type,
                from = %from,
                to = %job.status,
                files_processed = job.progress.files_processed,
                files_skipped = job.progress.files_skipped,
                files_degraded = job.progress.files_degraded,
                "job transition"
            );
            job.clone()
        };
        self.save(&snapshot).await;
        handle.status.send_replace(snapshot.status);
    }

    fn round_size(&self, provider: &dyn EmbeddingProvider) -> usize {
        (self.config.pipeline.max_concurrent_batches * provider.limits().max_batch_items).max(1)
    }

    async fn analyze_file(self: &Arc<Self>, file: SourceFile) -> FileOutcome {
        let metadata = match tokio::fs::metadata(&file.absolute_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FileOutcome::Missing(file),
            Err(e) => return FileOutcome::skipped(&file, "file_unreadable", e),
        };
        if metadata.len() > self.config.max_file_bytes {
            return FileOutcome::skipped(
                &file,
                "file_too_large",
                format!("{} bytes exceeds the {} byte limit", metadata.len(), self.config.max_file_bytes),
            );
        }
        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let bytes = match tokio::fs::read(&file.absolute_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FileOutcome::Missing(file),
            Err(e) => return FileOutcome::skipped(&file, "file_unreadable", e),
        };
        let Ok(text) = String::from_utf8(bytes) else {
            return FileOutcome::skipped(&file, "file_not_utf8", "file is not valid UTF-8");
        };

        let inner = Arc::clone(self);
        let absolute = file.absolute_path.to_string_lossy().to_string();
        let relative = file.relative_path.clone();
        let hint = file.language_hint.clone();
        let analysis = tokio::task::spawn_blocking(move || {
            chunk_source(&inner.registry, &inner.chunker, &absolute, &relative, &text, hint.as_deref())
        })
        .await;

        match analysis {
            Ok(Ok(chunked)) => {
                debug!(
                    path = %file.relative_path,
                    language = %chunked.language,
                    chunks = chunked.chunks.len(),
                    symbols = chunked.symbols.len(),
                    relationships = chunked.relationships.len(),
                    "file analyzed"
                );
                FileOutcome::Analyzed(AnalyzedFile {
                    source: file,
                    chunks: chunked.chunks,
                    last_modified,
                })
            }
            Ok(Err(e)) => FileOutcome::skipped(&file, e.code(), e),
            Err(e) => FileOutcome::skipped(&file, "analysis_panicked", e),
        }
    }

    async fn index_files(self: &Arc<Self>, handle: &JobHandle, files: Vec<SourceFile>, mode: RoundMode) -> Result<(), Abort> {
        let round_size = self.round_size(handle.provider.as_ref());
        let total = files.len();
        self.update(handle, |job| {
            job.progress.files_total = total;
            job.progress.current_step = "analyzing".to_string();
        })
        .await;

        let analyzed = futures::stream::iter(files)
            .map(|file| self.analyze_file(file))
            .buffered(self.config.max_workers.max(1));
        let mut analyzed = std::pin::pin!(analyzed);

        let mut round = Vec::new();
        let mut round_chunks = 0;
        while let Some(outcome) = analyzed.next().await {
            self.checkpoint(handle).await?;
            match outcome {
                FileOutcome::Analyzed(file) => {
                    round_chunks += file.chunks.len();
                    round.push(file);
                    if round_chunks >= round_size {
                        self.process_round(handle, std::mem::take(&mut round), mode)
                            .await?;
                        round_chunks = 0;
                    }
                }
                FileOutcome::Missing(file) if mode == RoundMode::Reindex => {
                    let removed = self
                        .store
                        .invalidate(&file.relative_path)
                        .await
                        .map_err(Abort::store)?;
                    debug!(path = %file.relative_path, removed, "file deleted, records invalidated");
                    self.update(handle, |job| job.progress.files_processed += 1)
                        .await;
                }
                FileOutcome::Missing(file) => {
                    warn!(path = %file.relative_path, "skipping missing file");
                    let error = JobError::new("file_missing", "file no longer exists", false)
                        .with_file(&file.relative_path);
                    self.update(handle, |job| {
                        job.progress.files_skipped += 1;
                        job.record_error(error);
                    })
                    .await;
                }
                FileOutcome::Skipped(error) => {
                    warn!(
                        path = error.file.as_deref().unwrap_or_default(),
                        code = %error.code,
                        error = %error.message,
                        "skipping file"
                    );
                    self.update(handle, |job| {
                        job.progress.files_skipped += 1;
                        job.record_error(error);
                    })
                    .await;
                }
            }
        }

        if !round.is_empty() {
            self.checkpoint(handle).await?;
            self.process_round(handle, round, mode).await?;
        }
        Ok(())
    }

    /// Embed and store the chunks of `files`.
    async fn process_round(&self, handle: &JobHandle, files: Vec<AnalyzedFile>, mode: RoundMode) -> Result<(), Abort> {
        let provider = Arc::clone(&handle.provider);
        let provider_name = provider.provider_name().to_string();
        let step = format!("embedding {} files", files.len());
        self.update(handle, |job| job.progress.current_step = step).await;

        if mode == RoundMode::Reindex {
            for file in &files {
                let removed = self
                    .store
                    .invalidate(&file.source.relative_path)
                    .await
                    .map_err(Abort::store)?;
                debug!(path = %file.source.relative_path, removed, "invalidated before reindex");
            }
        }

        let by_path: HashMap<&str, usize> = files
            .iter()
            .enumerate()
            .map(|(index, file)| (file.source.relative_path.as_str(), index))
            .collect();
        let mut tallies: Vec<FileTally> = files.iter().map(|_| FileTally::default()).collect();
        let mut pending = Vec::new();
        for (index, file) in files.iter().enumerate() {
            for chunk in &file.chunks {
                let id = fingerprint(&chunk.relative_path, chunk.start_line, chunk.end_line, &chunk.content);
                let stored = mode != RoundMode::Reindex
                    && self
                        .store
                        .contains(&id, &provider_name)
                        .await
                        .map_err(Abort::store)?;
                tallies[index].keep.insert(id);
                if stored {
                    tallies[index].reused += 1;
                } else {
                    pending.push(chunk.clone());
                }
            }
        }

        let output = if pending.is_empty() {
            PipelineOutput::default()
        } else {
            let job_id = handle.id;
            let mut pipeline = EmbeddingPipeline::new(self.config.pipeline.clone())
                .with_progress(Arc::new(move |progress: EmbedProgress| {
                    debug!(
                        job_id = %job_id,
                        batches_done = progress.batches_done,
                        batches_total = progress.batches_total,
                        items_processed = progress.items_processed,
                        "embedding progress"
                    );
                }));
            if let Some(limiter) = self.limiter(provider.as_ref()) {
                pipeline = pipeline.with_rate_limiter(limiter);
            }
            pipeline.embed(pending, provider, &handle.cancel).await
        };

        let mut records = Vec::with_capacity(output.embedded.len());
        for embedded in output.embedded {
            let Some(&index) = by_path.get(embedded.chunk.relative_path.as_str()) else {
                continue;
            };
            tallies[index].embedded += 1;
            tallies[index].truncated |= embedded.truncated;
            records.push(NewRecord::new(embedded, files[index].last_modified));
        }
        let stored = self.store.upsert(records).await.map_err(Abort::store)?;
        debug!(
            inserted = stored.inserted,
            replaced = stored.replaced,
            migrated = stored.migrated,
            unchanged = stored.unchanged,
            "round stored"
        );

        let mut batch_errors = Vec::new();
        for failure in &output.failures {
            let retryable = matches!(failure.class, ProviderError::Retryable);
            for path in &failure.files {
                if let Some(&index) = by_path.get(path.as_str()) {
                    tallies[index].failed = true;
                }
                batch_errors.push(
                    JobError::new(
                        "embedding_failed",
                        format!(
                            "batch {} failed after {} attempts: {}",
                            failure.batch_id, failure.attempts, failure.message
                        ),
                        retryable,
                    )
                    .with_file(path),
                );
            }
        }
        if !batch_errors.is_empty() {
            self.update(handle, |job| {
                for error in batch_errors {
                    job.record_error(error);
                }
            })
            .await;
        }

        for (file, tally) in files.iter().zip(&tallies) {
            let complete = !tally.failed && tally.embedded + tally.reused == file.chunks.len();
            if !complete && (output.cancelled || output.fatal.is_some()) {
                // Left for a later run.
                continue;
            }
            if complete && mode != RoundMode::Migrate {
                let removed = self
                    .store
                    .retain_for_path(&file.source.relative_path, &tally.keep)
                    .await
                    .map_err(Abort::store)?;
                if removed > 0 {
                    debug!(path = %file.source.relative_path, removed, "dropped records no longer produced");
                }
            }
            if !complete {
                warn!(
                    path = %file.source.relative_path,
                    embedded = tally.embedded + tally.reused,
                    chunks = file.chunks.len(),
                    "file indexed partially"
                );
            }

            let degraded = !complete || tally.truncated;
            let (chunks, embedded, reused) = (file.chunks.len(), tally.embedded, tally.reused);
            self.update(handle, |job| {
                job.progress.files_processed += 1;
                job.progress.chunks_total += chunks;
                job.progress.chunks_embedded += embedded;
                job.progress.chunks_reused += reused;
                if degraded {
                    job.progress.files_degraded += 1;
                }
            })
            .await;
        }

        if let Some(fatal) = output.fatal {
            let mut error = JobError::new("provider_fatal", fatal.message, false);
            if let Some(file) = fatal.files.into_iter().next() {
                error = error.with_file(file);
            }
            return Err(Abort::Fatal(error));
        }
        if output.cancelled {
            return Err(Abort::Cancelled);
        }
        Ok(())
    }

    /// Re-embed every record stored under another provider.
    async fn migrate(&self, handle: &JobHandle) -> Result<(), Abort> {
        let provider_name = handle.provider.provider_name().to_string();
        let mut by_path: BTreeMap<String, Vec<VectorRecord>> = BTreeMap::new();
        for record in self.store.all_records().await.map_err(Abort::store)? {
            if record.metadata.provider != provider_name {
                by_path
                    .entry(record.relative_path.clone())
                    .or_default()
                    .push(record);
            }
        }
        let total = by_path.len();
        info!(job_id = %handle.id, files = total, to = %provider_name, "migrating records");
        self.update(handle, |job| {
            job.progress.files_total = total;
            job.progress.current_step = "migrating".to_string();
        })
        .await;

        let round_size = self.round_size(handle.provider.as_ref());
        let mut round = Vec::new();
        let mut round_chunks = 0;
        for (path, records) in by_path {
            self.checkpoint(handle).await?;
            let mut chunks = Vec::with_capacity(records.len());
            for record in &records {
                match self.store.load_chunk(record).await {
                    Ok(chunk) => chunks.push(chunk),
                    Err(e) => {
                        warn!(id = %record.id, error = %e, "cannot migrate record with corrupt content blob");
                        let error = JobError::new(e.code(), &e, false).with_file(&path);
                        self.update(handle, |job| job.record_error(error)).await;
                    }
                }
            }
            let last_modified = records
                .iter()
                .map(|r| r.metadata.last_modified)
                .max()
                .unwrap_or_else(Utc::now);

            round_chunks += chunks.len();
            round.push(AnalyzedFile {
                source: SourceFile::new(self.config.base_path.join(&path), path),
                chunks,
                last_modified,
            });
            if round_chunks >= round_size {
                self.process_round(handle, std::mem::take(&mut round), RoundMode::Migrate)
                    .await?;
                round_chunks = 0;
            }
        }

        if !round.is_empty() {
            self.checkpoint(handle).await?;
            self.process_round(handle, round, RoundMode::Migrate).await?;
        }
        Ok(())
    }

    async fn cleanup(&self, handle: &JobHandle, files: Vec<SourceFile>) -> Result<(), Abort> {
        let live: HashSet<String> = files.into_iter().map(|f| f.relative_path).collect();
        let total = live.len();
        self.update(handle, |job| {
            job.progress.files_total = total;
            job.progress.current_step = "pruning".to_string();
        })
        .await;

        let removed = self
            .store
            .prune_paths_except(&live)
            .await
            .map_err(Abort::store)?;
        info!(job_id = %handle.id, removed, "removed records of vanished files");
        self.update(handle, |job| job.progress.files_processed = total)
            .await;
        Ok(())
    }

    async fn summarize(&self, handle: &JobHandle) -> Result<(), Abort> {
        self.update(handle, |job| job.progress.current_step = "summarizing".to_string())
            .await;
        let stats = self.store.stats().await.map_err(Abort::store)?;
        let summary = IndexSummary {
            records: stats.records,
            files: stats.files,
            truncated: stats.truncated,
            by_language: stats.by_language,
            by_chunk_type: stats.by_chunk_type,
            providers: stats.by_provider.into_keys().collect(),
        };
        self.update(handle, |job| job.summary = Some(summary)).await;
        Ok(())
    }
}
