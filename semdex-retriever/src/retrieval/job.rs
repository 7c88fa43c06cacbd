//! Processing jobs and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Types of processing jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Embed every supplied file, skipping chunks already stored
    FullIndex,
    /// Invalidate then re-index the supplied (changed) files
    IncrementalUpdate,
    /// Compute an [`IndexSummary`] of the store
    SummaryGeneration,
    /// Re-embed every stored record with the job's provider
    ProviderMigration,
    /// Drop records whose path is not in the supplied files
    Cleanup,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullIndex => "full_index",
            Self::IncrementalUpdate => "incremental_update",
            Self::SummaryGeneration => "summary_generation",
            Self::ProviderMigration => "provider_migration",
            Self::Cleanup => "cleanup",
        }
    }

    /// Whether the job consumes a file stream.
    pub fn takes_files(&self) -> bool {
        matches!(self, Self::FullIndex | Self::IncrementalUpdate | Self::Cleanup)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_index" => Ok(Self::FullIndex),
            "incremental_update" => Ok(Self::IncrementalUpdate),
            "summary_generation" => Ok(Self::SummaryGeneration),
            "provider_migration" => Ok(Self::ProviderMigration),
            "cleanup" => Ok(Self::Cleanup),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub current_step: String,
    pub files_total: usize,
    pub files_processed: usize,
    /// Files skipped because analysis failed
    pub files_skipped: usize,
    /// Files with at least one chunk that failed to embed or was truncated
    pub files_degraded: usize,
    pub chunks_total: usize,
    pub chunks_embedded: usize,
    /// Chunks already stored for the active provider
    pub chunks_reused: usize,
    pub percentage: f64,
    /// Files per second since the job started running
    pub rate: f64,
    pub eta_seconds: Option<u64>,
}

impl JobProgress {
    /// Recompute percentage, rate and ETA from the counters.
    pub fn refresh(&mut self, elapsed_secs: f64) {
        let done = self.files_processed + self.files_skipped;
        self.percentage = if self.files_total == 0 {
            100.0
        } else {
            (done as f64 / self.files_total as f64 * 100.0).min(100.0)
        };
        self.rate = if elapsed_secs > 0.0 {
            done as f64 / elapsed_secs
        } else {
            0.0
        };
        let remaining = self.files_total.saturating_sub(done);
        self.eta_seconds = (self.rate > 0.0).then(|| (remaining as f64 / self.rate).ceil() as u64);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
    pub file: Option<String>,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl ToString, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.to_string(),
            retryable,
            timestamp: Utc::now(),
            file: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn interrupted() -> Self {
        Self::new(
            "interrupted",
            "job was still active when the index was last closed",
            true,
        )
    }
}

/// Counts describing the contents of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub records: usize,
    pub files: usize,
    pub truncated: usize,
    pub by_language: BTreeMap<String, usize>,
    pub by_chunk_type: BTreeMap<String, usize>,
    pub providers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub repository_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Provider selected for this job
    pub provider: String,
    pub progress: JobProgress,
    pub errors: Vec<JobError>,
    /// First error that stopped the job
    pub fatal_error: Option<JobError>,
    pub summary: Option<IndexSummary>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessingJob {
    pub fn new(repository_id: impl Into<String>, job_type: JobType, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            repository_id: repository_id.into(),
            job_type,
            status: JobStatus::Pending,
            provider: provider.into(),
            progress: JobProgress::default(),
            errors: Vec::new(),
            fatal_error: None,
            summary: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobControlError> {
        if !self.status.can_transition_to(next) {
            return Err(JobControlError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Record a fatal error and fail the job.
    pub fn fail(&mut self, error: JobError) -> Result<(), JobControlError> {
        self.transition(JobStatus::Failed)?;
        self.errors.push(error.clone());
        if self.fatal_error.is_none() {
            self.fatal_error = Some(error);
        }
        Ok(())
    }

    pub fn record_error(&mut self, error: JobError) {
        self.errors.push(error);
        self.updated_at = Utc::now();
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started_at
            .map(|start| (Utc::now() - start).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobControlError {
    #[error("Unknown job: {0}")]
    UnknownJob(Uuid),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Unknown repository: {0}")]
    UnknownRepository(String),

    #[error("Unknown embedding provider: {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Store(#[from] crate::storage::StoreError),
}
