//! The embedding pipeline: batching, rate limiting, retries and partial
//! failure handling on top of any [`EmbeddingProvider`].

use crate::backoff::Backoff;
use crate::batch::{Batch, PreparedText, RetryAttempt, plan_batches};
use crate::config::PipelineConfig;
use crate::error::{EmbedError, ProviderError, Result};
use crate::provider::EmbeddingProvider;
use crate::rate_limit::RateLimiter;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use half::f16;
use semdex_context::TextChunk;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A chunk with its vector.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: TextChunk,
    pub vector: Vec<f16>,
    /// [`EmbeddingProvider::provider_name`] of the producing provider
    pub provider: String,
    pub embedded_at: DateTime<Utc>,
    /// The input was cut to the provider's input ceiling before embedding
    pub truncated: bool,
}

/// Snapshot passed to the progress callback after every finished batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EmbedProgress {
    pub items_processed: usize,
    pub items_total: usize,
    pub batches_done: usize,
    pub batches_total: usize,
    /// Items per second since the run started
    pub rate: f64,
}

pub type ProgressCallback = Arc<dyn Fn(EmbedProgress) + Send + Sync>;

/// A batch that did not produce vectors.
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub batch_id: usize,
    pub class: ProviderError,
    pub message: String,
    pub attempts: u32,
    /// Relative paths of the files whose chunks were in the batch
    pub files: Vec<String>,
}

/// Everything one [`EmbeddingPipeline::embed`] run produced.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub embedded: Vec<EmbeddedChunk>,
    pub batches: Vec<Batch>,
    /// Batches that exhausted their retries
    pub failures: Vec<BatchFailure>,
    /// The first fatal failure; no batch was launched after it
    pub fatal: Option<BatchFailure>,
    /// Cancellation stopped batches from being launched
    pub cancelled: bool,
    /// Number of inputs cut to the provider's input ceiling
    pub truncated: usize,
}

impl PipelineOutput {
    /// Every input chunk was embedded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.fatal.is_none() && !self.cancelled
    }
}

struct BatchOutcome {
    batch: Batch,
    result: Result<Vec<Vec<f16>>>,
}

/// Provider-agnostic embedding pipeline.
///
/// Up to `max_concurrent_batches` batches are in flight at once, every call
/// goes through the provider's rate limit and carries a timeout, and
/// retryable failures are retried with [`Backoff`]. A batch that runs out of
/// attempts is reported in [`PipelineOutput::failures`] while the other
/// batches continue. A fatal failure stops new batches from being launched.
#[derive(Clone, Default)]
pub struct EmbeddingPipeline {
    config: PipelineConfig,
    progress: Option<ProgressCallback>,
    limiter: Option<Arc<RateLimiter>>,
}

impl std::fmt::Debug for EmbeddingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingPipeline")
            .field("config", &self.config)
            .field("progress", &self.progress.is_some())
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl EmbeddingPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            progress: None,
            limiter: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Draw provider calls from `limiter` instead of a bucket private to
    /// each [`embed`](Self::embed) call. Share one limiter per provider so
    /// its quota holds across runs and jobs.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Embed `chunks` with `provider`.
    ///
    /// `cancel` is checked before each batch is launched; batches already
    /// sent to the provider always run to completion.
    pub async fn embed(
        &self,
        chunks: Vec<TextChunk>,
        provider: Arc<dyn EmbeddingProvider>,
        cancel: &CancellationToken,
    ) -> PipelineOutput {
        let limits = provider.limits();
        let prepared: Vec<PreparedText> = chunks
            .iter()
            .map(|chunk| PreparedText::new(chunk.build(), &limits))
            .collect();

        let truncated = prepared.iter().filter(|p| p.truncated).count();
        for (chunk, text) in chunks.iter().zip(&prepared) {
            if text.truncated {
                tracing::warn!(
                    path = %chunk.relative_path,
                    lines = %chunk.line_range(),
                    max_input_tokens = limits.max_input_tokens,
                    "chunk truncated to provider input limit, embedding quality degraded"
                );
            }
        }

        let batches = plan_batches(&prepared, &limits);
        let items_total = chunks.len();
        let batches_total = batches.len();
        tracing::debug!(
            items = items_total,
            batches = batches_total,
            provider = provider.provider_name(),
            "embedding chunks"
        );

        let limiter = self
            .limiter
            .clone()
            .or_else(|| RateLimiter::per_minute(limits.rate_per_minute).map(Arc::new));
        let halt = AtomicBool::new(false);
        let launched = AtomicUsize::new(0);
        let started = Instant::now();

        let prepared_ref = prepared.as_slice();
        let provider_ref: &dyn EmbeddingProvider = provider.as_ref();
        let limiter_ref = limiter.as_deref();
        let halt_ref = &halt;
        let launched_ref = &launched;

        let mut outcomes = futures::stream::iter(batches)
            .take_while(move |_| {
                futures::future::ready(!halt_ref.load(Ordering::SeqCst) && !cancel.is_cancelled())
            })
            .map(move |batch| {
                launched_ref.fetch_add(1, Ordering::SeqCst);
                self.run_batch(batch, prepared_ref, provider_ref, limiter_ref)
            })
            .buffer_unordered(self.config.max_concurrent_batches.max(1));

        let mut slots: Vec<Option<TextChunk>> = chunks.into_iter().map(Some).collect();
        let mut output = PipelineOutput {
            truncated,
            ..PipelineOutput::default()
        };
        let mut items_processed = 0;

        while let Some(BatchOutcome { batch, result }) = outcomes.next().await {
            items_processed += batch.len();
            match result {
                Ok(vectors) => {
                    let embedded_at = Utc::now();
                    for (&member, vector) in batch.members.iter().zip(vectors) {
                        if let Some(chunk) = slots[member].take() {
                            output.embedded.push(EmbeddedChunk {
                                chunk,
                                vector,
                                provider: provider.provider_name().to_string(),
                                embedded_at,
                                truncated: prepared[member].truncated,
                            });
                        }
                    }
                }
                Err(error) => {
                    let files: BTreeSet<String> = batch
                        .members
                        .iter()
                        .filter_map(|&m| slots[m].as_ref().map(|c| c.relative_path.clone()))
                        .collect();
                    let failure = BatchFailure {
                        batch_id: batch.id,
                        class: error.classify(),
                        message: error.to_string(),
                        attempts: batch.attempts.len() as u32,
                        files: files.into_iter().collect(),
                    };
                    match failure.class {
                        ProviderError::Fatal => {
                            halt.store(true, Ordering::SeqCst);
                            tracing::error!(batch = batch.id, error = %error, "fatal provider error, no further batches");
                            if output.fatal.is_none() {
                                output.fatal = Some(failure);
                            } else {
                                output.failures.push(failure);
                            }
                        }
                        ProviderError::Retryable => {
                            tracing::warn!(
                                batch = batch.id,
                                attempts = failure.attempts,
                                error = %error,
                                "embedding batch failed after retries"
                            );
                            output.failures.push(failure);
                        }
                    }
                }
            }
            output.batches.push(batch);

            if let Some(callback) = &self.progress {
                let elapsed = started.elapsed().as_secs_f64();
                callback(EmbedProgress {
                    items_processed,
                    items_total,
                    batches_done: output.batches.len(),
                    batches_total,
                    rate: if elapsed > 0.0 {
                        items_processed as f64 / elapsed
                    } else {
                        0.0
                    },
                });
            }
        }
        drop(outcomes);

        output.cancelled = cancel.is_cancelled() && launched.load(Ordering::SeqCst) < batches_total;
        if output.cancelled {
            tracing::info!(
                launched = launched.load(Ordering::SeqCst),
                batches = batches_total,
                "embedding cancelled"
            );
        }
        output.batches.sort_by_key(|b| b.id);
        output
    }

    async fn run_batch(
        &self,
        mut batch: Batch,
        prepared: &[PreparedText],
        provider: &dyn EmbeddingProvider,
        limiter: Option<&RateLimiter>,
    ) -> BatchOutcome {
        let policy = &self.config.retry;
        let timeout = self.config.request_timeout();
        let mut backoff = Backoff::new(policy.clone());
        let inputs: Vec<String> = batch
            .members
            .iter()
            .map(|&m| prepared[m].text.clone())
            .collect();

        batch.started_at = Some(Utc::now());
        let started = Instant::now();
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;
            if let Some(limiter) = limiter {
                limiter.acquire().await;
            }

            let call = match tokio::time::timeout(timeout, provider.embed_texts(&inputs)).await {
                Ok(result) => {
                    result.and_then(|r| check_result(r.embeddings, inputs.len(), provider.embedding_dimension()))
                }
                Err(_) => Err(EmbedError::Timeout { after: timeout }),
            };

            match call {
                Ok(vectors) => {
                    batch.attempts.push(RetryAttempt {
                        attempt,
                        timestamp: Utc::now(),
                        delay: Duration::ZERO,
                        error: None,
                        success: true,
                    });
                    break Ok(vectors);
                }
                Err(error) if error.is_retryable() && attempt < policy.max_attempts => {
                    let delay = backoff.next_delay(attempt);
                    tracing::warn!(
                        batch = batch.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "embedding batch failed, retrying"
                    );
                    batch.attempts.push(RetryAttempt {
                        attempt,
                        timestamp: Utc::now(),
                        delay,
                        error: Some(error.to_string()),
                        success: false,
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    batch.attempts.push(RetryAttempt {
                        attempt,
                        timestamp: Utc::now(),
                        delay: Duration::ZERO,
                        error: Some(error.to_string()),
                        success: false,
                    });
                    break Err(error);
                }
            }
        };

        batch.duration = Some(started.elapsed());
        match &result {
            Ok(_) => batch.success = true,
            Err(error) => batch.error = Some(error.to_string()),
        }
        BatchOutcome { batch, result }
    }
}

fn check_result(embeddings: Vec<Vec<f16>>, expected_count: usize, dimension: usize) -> Result<Vec<Vec<f16>>> {
    if embeddings.len() != expected_count {
        return Err(EmbedError::malformed(format!(
            "expected {expected_count} embeddings, got {}",
            embeddings.len()
        )));
    }
    if let Some(bad) = embeddings.iter().find(|e| e.len() != dimension) {
        return Err(EmbedError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        });
    }
    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderLimits, RetryPolicy};
    use crate::provider::{EmbeddingResult, HashingProvider};
    use async_trait::async_trait;
    use semdex_context::ChunkType;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    fn chunk(path: &str, sequence: usize, content: &str) -> TextChunk {
        TextChunk {
            repo: "repo".to_string(),
            file_path: format!("/repo/{path}"),
            relative_path: path.to_string(),
            sequence,
            start_line: sequence * 10 + 1,
            end_line: sequence * 10 + 5,
            start_byte: 0,
            end_byte: content.len(),
            chunk_type: ChunkType::Code,
            language: "rust".to_string(),
            function_name: None,
            class_name: None,
            imports: vec![],
            context_before: vec![],
            context_after: vec![],
            references: vec![],
            content: content.to_string(),
            byte_size: content.len(),
            token_estimate: content.len().div_ceil(4),
        }
    }

    /// Fails according to a script, otherwise defers to a hashing provider.
    struct ScriptedProvider {
        inner: HashingProvider,
        limits: ProviderLimits,
        calls: Mutex<Vec<Vec<String>>>,
        respond: Box<dyn Fn(usize, &[String]) -> Option<EmbedError> + Send + Sync>,
        cancel_on_call: Option<CancellationToken>,
        hang: bool,
    }

    impl ScriptedProvider {
        fn new(
            items_per_batch: usize,
            respond: impl Fn(usize, &[String]) -> Option<EmbedError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                inner: HashingProvider::new(16),
                limits: ProviderLimits::new(16).with_max_batch_items(items_per_batch),
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
                cancel_on_call: None,
                hang: false,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        async fn embed_texts(&self, texts: &[String]) -> crate::Result<EmbeddingResult> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(texts.to_vec());
                calls.len()
            };
            if let Some(token) = &self.cancel_on_call {
                token.cancel();
            }
            if self.hang && call == 1 {
                std::future::pending::<()>().await;
            }
            if let Some(error) = (self.respond)(call, texts) {
                return Err(error);
            }
            self.inner.embed_texts(texts).await
        }

        fn embedding_dimension(&self) -> usize {
            16
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }

        fn limits(&self) -> ProviderLimits {
            self.limits.clone()
        }
    }

    fn unavailable() -> EmbedError {
        EmbedError::Unavailable {
            status: 503,
            message: "overloaded".to_string(),
        }
    }

    fn fast_retries(max_attempts: u32) -> PipelineConfig {
        PipelineConfig::new().with_retry(
            RetryPolicy::new()
                .with_max_attempts(max_attempts)
                .with_initial_delay(Duration::from_millis(100)),
        )
    }

    #[tokio::test]
    async fn test_embeds_every_chunk() -> anyhow::Result<()> {
        let chunks: Vec<_> = (0..5).map(|i| chunk("src/a.rs", i, &format!("fn f{i}() {{}}"))).collect();
        let provider = Arc::new(HashingProvider::new(32).with_limits(ProviderLimits::new(32).with_max_batch_items(2)));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress);

        let pipeline = EmbeddingPipeline::new(PipelineConfig::new())
            .with_progress(Arc::new(move |p: EmbedProgress| sink.lock().unwrap().push(p)));
        let output = pipeline.embed(chunks, provider, &CancellationToken::new()).await;

        assert!(output.is_complete());
        assert_eq!(output.embedded.len(), 5);
        assert_eq!(output.batches.len(), 3);
        assert!(output.embedded.iter().all(|e| e.vector.len() == 32 && e.provider == "hashing-32"));

        let progress = progress.lock().unwrap();
        assert_eq!(progress.len(), 3);
        let last = progress.last().unwrap();
        assert_eq!((last.items_processed, last.items_total), (5, 5));
        assert_eq!((last.batches_done, last.batches_total), (3, 3));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_limiter_holds_quota_across_runs() -> anyhow::Result<()> {
        let limits = ProviderLimits::new(16)
            .with_max_batch_items(1)
            .with_rate_per_minute(60);
        let provider = Arc::new(HashingProvider::new(16).with_limits(limits));
        let limiter = Arc::new(RateLimiter::per_minute(60).unwrap());
        let start = Instant::now();

        for i in 0..4 {
            let output = EmbeddingPipeline::new(PipelineConfig::new())
                .with_rate_limiter(Arc::clone(&limiter))
                .embed(
                    vec![chunk("src/a.rs", i, &format!("fn f{i}() {{}}"))],
                    provider.clone(),
                    &CancellationToken::new(),
                )
                .await;
            assert!(output.is_complete());
        }

        // One call from the initial bucket, then one per second.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2990), "{elapsed:?}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unshared_runs_each_start_with_full_bucket() -> anyhow::Result<()> {
        let limits = ProviderLimits::new(16)
            .with_max_batch_items(1)
            .with_rate_per_minute(60);
        let provider = Arc::new(HashingProvider::new(16).with_limits(limits));
        let start = Instant::now();

        for i in 0..2 {
            EmbeddingPipeline::new(PipelineConfig::new())
                .embed(
                    vec![chunk("src/a.rs", i, "fn f() {}")],
                    provider.clone(),
                    &CancellationToken::new(),
                )
                .await;
        }

        assert!(start.elapsed() < Duration::from_millis(500));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_recovers() -> anyhow::Result<()> {
        let provider = Arc::new(ScriptedProvider::new(8, |call, _| (call <= 2).then(unavailable)));
        let chunks = vec![chunk("src/a.rs", 0, "fn a() {}")];

        let output = EmbeddingPipeline::new(fast_retries(3))
            .embed(chunks, provider.clone(), &CancellationToken::new())
            .await;

        assert!(output.is_complete());
        assert_eq!(provider.call_count(), 3);
        let attempts = &output.batches[0].attempts;
        assert_eq!(attempts.len(), 3);
        assert!(attempts[2].success);
        assert!(attempts[1].delay > attempts[0].delay);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_exhausted_batch_does_not_stop_others() -> anyhow::Result<()> {
        let provider = Arc::new(ScriptedProvider::new(1, |_, texts| {
            texts.iter().any(|t| t.contains("poison")).then(unavailable)
        }));
        let chunks = vec![
            chunk("src/a.rs", 0, "fn a() {}"),
            chunk("src/b.rs", 0, "fn poison() {}"),
            chunk("src/c.rs", 0, "fn c() {}"),
        ];

        let output = EmbeddingPipeline::new(fast_retries(4))
            .embed(chunks, provider.clone(), &CancellationToken::new())
            .await;

        assert_eq!(output.embedded.len(), 2);
        assert!(output.fatal.is_none());
        assert_eq!(output.failures.len(), 1);
        let failure = &output.failures[0];
        assert_eq!(failure.class, ProviderError::Retryable);
        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.files, vec!["src/b.rs".to_string()]);

        let failed = output.batches.iter().find(|b| !b.success).unwrap();
        let delays: Vec<Duration> = failed.attempts[..3].iter().map(|a| a.delay).collect();
        assert!(delays.windows(2).all(|pair| pair[0] < pair[1]), "{delays:?}");
        assert_eq!(provider.call_count(), 2 + 4);
        assert!(logs_contain("embedding batch failed, retrying"));
        Ok(())
    }

    #[tokio::test]
    async fn test_fatal_error_stops_new_batches() -> anyhow::Result<()> {
        let provider = Arc::new(ScriptedProvider::new(1, |call, _| {
            (call == 2).then(|| EmbedError::from_status(401, "invalid api key"))
        }));
        let chunks: Vec<_> = (0..5).map(|i| chunk("src/a.rs", i, &format!("fn f{i}() {{}}"))).collect();

        let output = EmbeddingPipeline::new(PipelineConfig::new().with_max_concurrent_batches(1))
            .embed(chunks, provider.clone(), &CancellationToken::new())
            .await;

        let fatal = output.fatal.as_ref().unwrap();
        assert_eq!(fatal.class, ProviderError::Fatal);
        assert_eq!(fatal.attempts, 1);
        assert_eq!(provider.call_count(), 2);
        assert_eq!(output.embedded.len(), 1);
        assert!(!output.is_complete());
        Ok(())
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() -> anyhow::Result<()> {
        struct WrongSize;

        #[async_trait]
        impl EmbeddingProvider for WrongSize {
            async fn embed_texts(&self, texts: &[String]) -> crate::Result<EmbeddingResult> {
                Ok(EmbeddingResult::new(vec![vec![f16::ZERO; 4]; texts.len()]))
            }
            fn embedding_dimension(&self) -> usize {
                8
            }
            fn provider_name(&self) -> &str {
                "wrong-size"
            }
            fn limits(&self) -> ProviderLimits {
                ProviderLimits::new(8)
            }
        }

        let output = EmbeddingPipeline::default()
            .embed(vec![chunk("src/a.rs", 0, "fn a() {}")], Arc::new(WrongSize), &CancellationToken::new())
            .await;
        let fatal = output.fatal.unwrap();
        assert!(fatal.message.contains("expected 8, got 4"));
        assert!(output.embedded.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() -> anyhow::Result<()> {
        let mut scripted = ScriptedProvider::new(8, |_, _| None);
        scripted.hang = true;
        let provider = Arc::new(scripted);

        let output = EmbeddingPipeline::new(fast_retries(2).with_request_timeout(Duration::from_secs(5)))
            .embed(vec![chunk("src/a.rs", 0, "fn a() {}")], provider.clone(), &CancellationToken::new())
            .await;

        assert!(output.is_complete());
        let attempts = &output.batches[0].attempts;
        assert!(attempts[0].error.as_deref().unwrap().contains("timed out"));
        assert!(attempts[1].success);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_between_batches() -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let mut scripted = ScriptedProvider::new(1, |_, _| None);
        scripted.cancel_on_call = Some(cancel.clone());
        let provider = Arc::new(scripted);
        let chunks: Vec<_> = (0..4).map(|i| chunk("src/a.rs", i, &format!("fn f{i}() {{}}"))).collect();

        let output = EmbeddingPipeline::new(PipelineConfig::new().with_max_concurrent_batches(1))
            .embed(chunks, provider.clone(), &cancel)
            .await;

        assert!(output.cancelled);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(output.embedded.len(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_oversized_chunk_is_truncated_not_failed() -> anyhow::Result<()> {
        let limits = ProviderLimits::new(16).with_max_batch_tokens(64).with_max_input_tokens(64);
        let provider = Arc::new(HashingProvider::new(16).with_limits(limits));
        let chunks = vec![
            chunk("src/a.rs", 0, "fn small() {}"),
            chunk("src/big.rs", 0, &"let x = 1;\n".repeat(100)),
        ];

        let output = EmbeddingPipeline::default()
            .embed(chunks, provider, &CancellationToken::new())
            .await;

        assert!(output.is_complete());
        assert_eq!(output.truncated, 1);
        let big = output
            .embedded
            .iter()
            .find(|e| e.chunk.relative_path == "src/big.rs")
            .unwrap();
        assert!(big.truncated);
        assert!(logs_contain("embedding quality degraded"));
        Ok(())
    }
}
