//! Job and repository persistence.
//!
//! Jobs are stored as JSON documents with their status and repository
//! duplicated into columns for filtering. Rows survive restarts, which is
//! how an interrupted job gets reported.

use super::{Result, StoreError};
use crate::retrieval::job::{JobError, JobStatus, ProcessingJob};
use crate::retrieval::repository::RepositoryInfo;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                last_accessed INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                repository_id TEXT NOT NULL REFERENCES repositories(id),
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_repository ON jobs(repository_id)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub async fn save_job(&self, job: &ProcessingJob) -> Result<()> {
        let data = serde_json::to_string(job).map_err(|e| StoreError::write(format!("job {}", job.id), e))?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, repository_id, job_type, status, data, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.repository_id)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(data)
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::write(format!("job {}", job.id), e))?;
        Ok(())
    }

    pub async fn load_job(&self, id: Uuid) -> Result<Option<ProcessingJob>> {
        let row = sqlx::query("SELECT data FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_job(&id.to_string(), row.try_get("data")?))
            .transpose()
    }

    /// Jobs in creation order, optionally for one repository.
    pub async fn list_jobs(&self, repository_id: Option<&str>) -> Result<Vec<ProcessingJob>> {
        let rows = match repository_id {
            Some(repository_id) => {
                sqlx::query("SELECT id, data FROM jobs WHERE repository_id = ?1 ORDER BY created_at, id")
                    .bind(repository_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT id, data FROM jobs ORDER BY created_at, id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            match decode_job(&id, row.try_get("data")?) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(job_id = %id, error = %e, "skipping unreadable job"),
            }
        }
        Ok(jobs)
    }

    /// Fail every job left `running` or `paused` by a previous process.
    pub async fn mark_interrupted(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id, data FROM jobs WHERE status IN ('running', 'paused')")
            .fetch_all(&self.pool)
            .await?;

        let mut interrupted = Vec::new();
        for row in rows {
            let id: String = row.try_get("id")?;
            let mut job = match decode_job(&id, row.try_get("data")?) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "skipping unreadable job");
                    continue;
                }
            };
            let error = JobError::interrupted();
            job.status = JobStatus::Failed;
            job.updated_at = error.timestamp;
            job.finished_at = Some(error.timestamp);
            job.errors.push(error.clone());
            job.fatal_error.get_or_insert(error);
            self.save_job(&job).await?;
            interrupted.push(job.id);
        }
        Ok(interrupted)
    }

    /// Insert a repository, or refresh the stored one's branch and access time.
    pub async fn upsert_repository(&self, repository: &RepositoryInfo) -> Result<RepositoryInfo> {
        let stored = match self.get_repository(&repository.id).await? {
            Some(mut existing) => {
                let now = Utc::now();
                if repository.branch.is_some() {
                    existing.branch = repository.branch.clone();
                }
                existing.updated_at = now;
                existing.last_accessed = now;
                existing
            }
            None => repository.clone(),
        };
        self.write_repository(&stored).await?;
        Ok(stored)
    }

    pub async fn get_repository(&self, id: &str) -> Result<Option<RepositoryInfo>> {
        let row = sqlx::query("SELECT data FROM repositories WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: String = row.try_get("data")?;
                serde_json::from_str(&data)
                    .map(Some)
                    .map_err(|e| StoreError::corruption(id, e))
            }
            None => Ok(None),
        }
    }

    pub async fn list_repositories(&self) -> Result<Vec<RepositoryInfo>> {
        let rows = sqlx::query("SELECT id, data FROM repositories ORDER BY last_accessed DESC")
            .fetch_all(&self.pool)
            .await?;
        let mut repositories = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let data: String = row.try_get("data")?;
            match serde_json::from_str(&data) {
                Ok(repository) => repositories.push(repository),
                Err(e) => warn!(repository_id = %id, error = %e, "skipping unreadable repository"),
            }
        }
        Ok(repositories)
    }

    /// Bump the last-accessed time of a repository, if it exists.
    pub async fn touch_repository(&self, id: &str) -> Result<Option<RepositoryInfo>> {
        let Some(mut repository) = self.get_repository(id).await? else {
            return Ok(None);
        };
        repository.last_accessed = Utc::now();
        self.write_repository(&repository).await?;
        Ok(Some(repository))
    }

    async fn write_repository(&self, repository: &RepositoryInfo) -> Result<()> {
        let data = serde_json::to_string(repository)
            .map_err(|e| StoreError::write(format!("repository {}", repository.id), e))?;
        sqlx::query(
            r#"
            INSERT INTO repositories (id, data, last_accessed) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET data = excluded.data, last_accessed = excluded.last_accessed
            "#,
        )
        .bind(&repository.id)
        .bind(data)
        .bind(repository.last_accessed.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::write(format!("repository {}", repository.id), e))?;
        Ok(())
    }
}

fn decode_job(id: &str, data: String) -> Result<ProcessingJob> {
    serde_json::from_str(&data).map_err(|e| StoreError::corruption(id, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::job::JobType;
    use crate::storage::open_pool;
    use tempfile::tempdir;

    async fn store_with_repo(dir: &std::path::Path) -> anyhow::Result<(JobStore, RepositoryInfo)> {
        let store = JobStore::new(open_pool(dir).await?).await?;
        let repo = store
            .upsert_repository(&RepositoryInfo::new(dir, None, None))
            .await?;
        Ok((store, repo))
    }

    #[tokio::test]
    async fn test_job_round_trip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (store, repo) = store_with_repo(dir.path()).await?;

        let mut job = ProcessingJob::new(&repo.id, JobType::FullIndex, "hashing-8");
        store.save_job(&job).await?;
        job.transition(JobStatus::Running)?;
        job.progress.files_processed = 3;
        store.save_job(&job).await?;

        let loaded = store.load_job(job.id).await?.unwrap();
        assert_eq!(loaded, job);
        assert!(store.load_job(Uuid::new_v4()).await?.is_none());
        assert_eq!(store.list_jobs(Some(&repo.id)).await?.len(), 1);
        assert!(store.list_jobs(Some("other")).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_mark_interrupted() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (store, repo) = store_with_repo(dir.path()).await?;

        let mut running = ProcessingJob::new(&repo.id, JobType::FullIndex, "p");
        running.transition(JobStatus::Running)?;
        let mut paused = ProcessingJob::new(&repo.id, JobType::IncrementalUpdate, "p");
        paused.transition(JobStatus::Running)?;
        paused.transition(JobStatus::Paused)?;
        let pending = ProcessingJob::new(&repo.id, JobType::Cleanup, "p");
        for job in [&running, &paused, &pending] {
            store.save_job(job).await?;
        }

        let mut interrupted = store.mark_interrupted().await?;
        interrupted.sort();
        let mut expected = vec![running.id, paused.id];
        expected.sort();
        assert_eq!(interrupted, expected);

        let reloaded = store.load_job(running.id).await?.unwrap();
        assert_eq!(reloaded.status, JobStatus::Failed);
        let fatal = reloaded.fatal_error.unwrap();
        assert_eq!(fatal.code, "interrupted");
        assert!(fatal.retryable);
        assert_eq!(store.load_job(pending.id).await?.unwrap().status, JobStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_repository_upsert_keeps_creation_time() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (store, repo) = store_with_repo(dir.path()).await?;

        let again = store
            .upsert_repository(&RepositoryInfo::new(dir.path(), None, Some("dev".to_string())))
            .await?;
        assert_eq!(again.id, repo.id);
        assert_eq!(again.created_at, repo.created_at);
        assert_eq!(again.branch.as_deref(), Some("dev"));
        assert_eq!(store.list_repositories().await?.len(), 1);

        let touched = store.touch_repository(&repo.id).await?.unwrap();
        assert!(touched.last_accessed >= repo.last_accessed);
        assert!(store.touch_repository("missing").await?.is_none());
        Ok(())
    }
}
