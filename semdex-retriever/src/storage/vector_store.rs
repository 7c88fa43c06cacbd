//! Vector records in SQLite with their vectors and content in blob files.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE records (
//!     id TEXT PRIMARY KEY,          -- fingerprint (blake3 hex)
//!     relative_path TEXT NOT NULL,
//!     start_line INTEGER NOT NULL,
//!     end_line INTEGER NOT NULL,
//!     vector_path TEXT NOT NULL,    -- relative to the index directory
//!     content_path TEXT NOT NULL,
//!     language TEXT NOT NULL,
//!     chunk_type TEXT NOT NULL,
//!     function_name TEXT,
//!     class_name TEXT,
//!     last_modified INTEGER NOT NULL, -- unix millis of the source file
//!     provider TEXT NOT NULL,
//!     dimension INTEGER NOT NULL,
//!     truncated INTEGER NOT NULL,
//!     indexed_at INTEGER NOT NULL
//! );
//! ```
//!
//! Writes for one `(path, start_line, end_line)` slot are serialized by an
//! async mutex from a [`DashMap`]; different slots are written in parallel.

use super::{Result, StoreError, fingerprint, open_pool};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use half::f16;
use semdex_context::{ChunkType, TextChunk};
use semdex_embed::EmbeddedChunk;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

const RECORD_COLUMNS: &str = "id, relative_path, start_line, end_line, vector_path, content_path, \
     language, chunk_type, function_name, class_name, last_modified, provider, dimension, truncated";

/// Upserts running at once within one [`VectorStore::upsert`] call.
const PARALLEL_WRITES: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub language: String,
    pub chunk_type: ChunkType,
    pub function_name: Option<String>,
    pub class_name: Option<String>,
    /// Modification time of the source file when it was indexed
    pub last_modified: DateTime<Utc>,
    pub provider: String,
    pub dimension: usize,
    pub truncated: bool,
}

/// Persisted form of an embedded chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorRecord {
    pub id: String,
    pub relative_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub vector_path: PathBuf,
    pub content_path: PathBuf,
    pub metadata: RecordMetadata,
}

#[derive(Serialize)]
struct ContentBlobRef<'a> {
    chunk: &'a TextChunk,
    metadata: &'a RecordMetadata,
}

#[derive(Deserialize)]
struct ContentBlob {
    chunk: TextChunk,
}

/// Input to [`VectorStore::upsert`].
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub embedded: EmbeddedChunk,
    pub last_modified: DateTime<Utc>,
}

impl NewRecord {
    pub fn new(embedded: EmbeddedChunk, last_modified: DateTime<Utc>) -> Self {
        Self {
            embedded,
            last_modified,
        }
    }

    pub fn id(&self) -> String {
        let chunk = &self.embedded.chunk;
        fingerprint(&chunk.relative_path, chunk.start_line, chunk.end_line, &chunk.content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertOutcome {
    Inserted,
    Replaced,
    Migrated,
    Unchanged,
}

/// What an [`VectorStore::upsert`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    /// New fingerprint in an empty slot
    pub inserted: usize,
    /// New fingerprint that displaced an older one in the same slot
    pub replaced: usize,
    /// Same fingerprint, vector replaced for a different provider
    pub migrated: usize,
    /// Same fingerprint and provider; nothing written
    pub unchanged: usize,
}

/// Metadata filters for [`VectorStore::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub language: Option<String>,
    pub chunk_type: Option<ChunkType>,
    pub path_prefix: Option<String>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_chunk_type(mut self, chunk_type: ChunkType) -> Self {
        self.chunk_type = Some(chunk_type);
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub score: f32,
    pub record: VectorRecord,
    pub chunk: TextChunk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub files: usize,
    pub truncated: usize,
    pub by_language: BTreeMap<String, usize>,
    pub by_chunk_type: BTreeMap<String, usize>,
    pub by_provider: BTreeMap<String, usize>,
}

#[derive(Clone, Debug)]
pub struct VectorStore {
    index_dir: PathBuf,
    pool: SqlitePool,
    slots: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl VectorStore {
    /// Open the store in `index_dir`, creating it if needed.
    pub async fn open(index_dir: &Path) -> Result<Self> {
        let pool = open_pool(index_dir).await?;
        Self::with_pool(index_dir, pool).await
    }

    /// Use an already opened pool (shared with the job store).
    pub async fn with_pool(index_dir: &Path, pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self {
            index_dir: index_dir.to_path_buf(),
            pool,
            slots: Arc::new(DashMap::new()),
        })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                relative_path TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                vector_path TEXT NOT NULL,
                content_path TEXT NOT NULL,
                language TEXT NOT NULL,
                chunk_type TEXT NOT NULL,
                function_name TEXT,
                class_name TEXT,
                last_modified INTEGER NOT NULL,
                provider TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                truncated INTEGER NOT NULL DEFAULT 0,
                indexed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_path ON records(relative_path)")
            .execute(pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_slot ON records(relative_path, start_line, end_line)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn blob_paths(id: &str) -> (PathBuf, PathBuf) {
        let shard = id.get(..2).unwrap_or("00");
        let dir = Path::new("blobs").join(shard);
        (dir.join(format!("{id}.vec")), dir.join(format!("{id}.json")))
    }

    async fn lock_slot(&self, relative_path: &str, start_line: usize, end_line: usize) -> OwnedMutexGuard<()> {
        let key = format!("{relative_path}:{start_line}-{end_line}");
        let lock = self.slots.entry(key).or_default().clone();
        lock.lock_owned().await
    }

    /// Insert or replace records.
    ///
    /// - same fingerprint, same provider: no-op
    /// - same fingerprint, other provider: vector replaced in place
    /// - new fingerprint: inserted; older records in the same slot are removed
    pub async fn upsert(&self, records: Vec<NewRecord>) -> Result<UpsertSummary> {
        let outcomes: Vec<UpsertOutcome> = futures::stream::iter(records)
            .map(|record| self.upsert_one(record))
            .buffer_unordered(PARALLEL_WRITES)
            .try_collect()
            .await?;

        let mut summary = UpsertSummary::default();
        for outcome in outcomes {
            match outcome {
                UpsertOutcome::Inserted => summary.inserted += 1,
                UpsertOutcome::Replaced => summary.replaced += 1,
                UpsertOutcome::Migrated => summary.migrated += 1,
                UpsertOutcome::Unchanged => summary.unchanged += 1,
            }
        }
        Ok(summary)
    }

    async fn upsert_one(&self, record: NewRecord) -> Result<UpsertOutcome> {
        let id = record.id();
        let chunk = &record.embedded.chunk;
        let _slot = self
            .lock_slot(&chunk.relative_path, chunk.start_line, chunk.end_line)
            .await;

        let metadata = RecordMetadata {
            language: chunk.language.clone(),
            chunk_type: chunk.chunk_type,
            function_name: chunk.function_name.clone(),
            class_name: chunk.class_name.clone(),
            last_modified: record.last_modified,
            provider: record.embedded.provider.clone(),
            dimension: record.embedded.vector.len(),
            truncated: record.embedded.truncated,
        };
        let now = Utc::now().timestamp_millis();

        let existing: Option<String> =
            sqlx::query_scalar("SELECT provider FROM records WHERE id = ?1")
                .bind(&id)
                .fetch_optional(&self.pool)
                .await?;

        if let Some(provider) = existing {
            if provider == metadata.provider {
                return Ok(UpsertOutcome::Unchanged);
            }
            self.write_blobs(&id, &record.embedded.vector, chunk, &metadata)
                .await?;
            sqlx::query(
                "UPDATE records SET provider = ?2, dimension = ?3, last_modified = ?4, truncated = ?5, indexed_at = ?6 WHERE id = ?1",
            )
            .bind(&id)
            .bind(&metadata.provider)
            .bind(metadata.dimension as i64)
            .bind(metadata.last_modified.timestamp_millis())
            .bind(metadata.truncated)
            .bind(now)
            .execute(&self.pool)
            .await?;
            debug!(id = %id, from = %provider, to = %metadata.provider, "vector migrated");
            return Ok(UpsertOutcome::Migrated);
        }

        let stale: Vec<VectorRecord> = self
            .select_where(
                "relative_path = ?1 AND start_line = ?2 AND end_line = ?3",
                &[
                    chunk.relative_path.clone(),
                    chunk.start_line.to_string(),
                    chunk.end_line.to_string(),
                ],
            )
            .await?;

        // Nothing references these blobs until the insert commits.
        let written = match self
            .write_blobs(&id, &record.embedded.vector, chunk, &metadata)
            .await
        {
            Ok(()) => self.insert_record(&id, chunk, &metadata, now, &stale).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.discard_blobs(&id).await;
            return Err(e);
        }

        for old in &stale {
            self.remove_blobs(old).await;
        }
        Ok(if stale.is_empty() {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Replaced
        })
    }

    /// Insert the record for `id` and drop the `stale` records of its slot in one transaction.
    async fn insert_record(
        &self,
        id: &str,
        chunk: &TextChunk,
        metadata: &RecordMetadata,
        now: i64,
        stale: &[VectorRecord],
    ) -> Result<()> {
        let (vector_path, content_path) = Self::blob_paths(id);
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO records (id, relative_path, start_line, end_line, vector_path, content_path,
                language, chunk_type, function_name, class_name, last_modified, provider, dimension,
                truncated, indexed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(id)
        .bind(&chunk.relative_path)
        .bind(chunk.start_line as i64)
        .bind(chunk.end_line as i64)
        .bind(vector_path.to_string_lossy().to_string())
        .bind(content_path.to_string_lossy().to_string())
        .bind(&metadata.language)
        .bind(metadata.chunk_type.as_str())
        .bind(&metadata.function_name)
        .bind(&metadata.class_name)
        .bind(metadata.last_modified.timestamp_millis())
        .bind(&metadata.provider)
        .bind(metadata.dimension as i64)
        .bind(metadata.truncated)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        for old in stale {
            sqlx::query("DELETE FROM records WHERE id = ?1")
                .bind(&old.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn write_blobs(
        &self,
        id: &str,
        vector: &[f16],
        chunk: &TextChunk,
        metadata: &RecordMetadata,
    ) -> Result<()> {
        let (vector_path, content_path) = Self::blob_paths(id);
        let vector_bytes: &[u8] = bytemuck::cast_slice(vector);
        let content = serde_json::to_vec(&ContentBlobRef { chunk, metadata })
            .map_err(|e| StoreError::write(content_path.display().to_string(), e))?;

        write_atomic(&self.index_dir.join(vector_path), vector_bytes).await?;
        write_atomic(&self.index_dir.join(content_path), &content).await
    }

    async fn discard_blobs(&self, id: &str) {
        let (vector_path, content_path) = Self::blob_paths(id);
        for path in [self.index_dir.join(vector_path), self.index_dir.join(content_path)] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove unreferenced blob");
                }
            }
        }
    }

    async fn remove_blobs(&self, record: &VectorRecord) {
        for path in [&record.vector_path, &record.content_path] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove blob");
                }
            }
        }
    }

    async fn remove_record(&self, record: &VectorRecord) -> Result<()> {
        let _slot = self
            .lock_slot(&record.relative_path, record.start_line, record.end_line)
            .await;
        sqlx::query("DELETE FROM records WHERE id = ?1")
            .bind(&record.id)
            .execute(&self.pool)
            .await?;
        self.remove_blobs(record).await;
        Ok(())
    }

    fn record_from_row(&self, row: &SqliteRow) -> Result<VectorRecord> {
        let id: String = row.try_get("id")?;
        let chunk_type: String = row.try_get("chunk_type")?;
        let chunk_type = chunk_type
            .parse::<ChunkType>()
            .map_err(|e| StoreError::corruption(&id, e))?;
        let last_modified: i64 = row.try_get("last_modified")?;
        let vector_path: String = row.try_get("vector_path")?;
        let content_path: String = row.try_get("content_path")?;
        let start_line: i64 = row.try_get("start_line")?;
        let end_line: i64 = row.try_get("end_line")?;
        let dimension: i64 = row.try_get("dimension")?;

        Ok(VectorRecord {
            relative_path: row.try_get("relative_path")?,
            start_line: start_line as usize,
            end_line: end_line as usize,
            vector_path: self.index_dir.join(vector_path),
            content_path: self.index_dir.join(content_path),
            metadata: RecordMetadata {
                language: row.try_get("language")?,
                chunk_type,
                function_name: row.try_get("function_name")?,
                class_name: row.try_get("class_name")?,
                last_modified: Utc
                    .timestamp_millis_opt(last_modified)
                    .single()
                    .unwrap_or_default(),
                provider: row.try_get("provider")?,
                dimension: dimension as usize,
                truncated: row.try_get("truncated")?,
            },
            id,
        })
    }

    async fn select_where(&self, condition: &str, binds: &[String]) -> Result<Vec<VectorRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE {condition} ORDER BY relative_path, start_line"
        );
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(|row| self.record_from_row(row)).collect()
    }

    async fn select_filtered(&self, filter: &QueryFilter) -> Result<Vec<VectorRecord>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {RECORD_COLUMNS} FROM records WHERE 1 = 1"));
        if let Some(language) = &filter.language {
            builder.push(" AND language = ").push_bind(language.clone());
        }
        if let Some(chunk_type) = filter.chunk_type {
            builder.push(" AND chunk_type = ").push_bind(chunk_type.as_str());
        }
        if let Some(prefix) = &filter.path_prefix {
            builder
                .push(" AND substr(relative_path, 1, length(")
                .push_bind(prefix.clone())
                .push(")) = ")
                .push_bind(prefix.clone());
        }
        builder.push(" ORDER BY relative_path, start_line");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.record_from_row(row) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping unreadable record row"),
            }
        }
        Ok(records)
    }

    /// Read a record's vector blob.
    pub async fn load_vector(&self, record: &VectorRecord) -> Result<Vec<f16>> {
        let bytes = tokio::fs::read(&record.vector_path)
            .await
            .map_err(|e| StoreError::corruption(&record.id, e))?;
        if bytes.len() != record.metadata.dimension * 2 {
            return Err(StoreError::corruption(
                &record.id,
                format!(
                    "vector blob has {} bytes, expected {}",
                    bytes.len(),
                    record.metadata.dimension * 2
                ),
            ));
        }
        // The read buffer carries no alignment guarantee for f16.
        Ok(bytemuck::pod_collect_to_vec::<u8, f16>(&bytes))
    }

    /// Read the chunk stored in a record's content blob.
    pub async fn load_chunk(&self, record: &VectorRecord) -> Result<TextChunk> {
        let bytes = tokio::fs::read(&record.content_path)
            .await
            .map_err(|e| StoreError::corruption(&record.id, e))?;
        serde_json::from_slice::<ContentBlob>(&bytes)
            .map(|blob| blob.chunk)
            .map_err(|e| StoreError::corruption(&record.id, e))
    }

    /// Top `k` records by cosine similarity to `vector`.
    ///
    /// Ties go to the most recently modified record. Records whose blobs are
    /// missing or corrupt are skipped with a warning, as are records of a
    /// different dimensionality.
    pub async fn query(&self, vector: &[f16], k: usize, filter: &QueryFilter) -> Result<Vec<ScoredRecord>> {
        if k == 0 || vector.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored = Vec::new();
        for record in self.select_filtered(filter).await? {
            if record.metadata.dimension != vector.len() {
                debug!(id = %record.id, dimension = record.metadata.dimension, "skipping record of other dimension");
                continue;
            }
            match self.load_vector(&record).await {
                Ok(stored) => scored.push((cosine_similarity(vector, &stored), record)),
                Err(e) => warn!(id = %record.id, error = %e, "skipping record with corrupt vector blob"),
            }
        }

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .total_cmp(score_a)
                .then_with(|| b.metadata.last_modified.cmp(&a.metadata.last_modified))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut results = Vec::with_capacity(k.min(scored.len()));
        for (score, record) in scored {
            if results.len() == k {
                break;
            }
            match self.load_chunk(&record).await {
                Ok(chunk) => results.push(ScoredRecord { score, record, chunk }),
                Err(e) => warn!(id = %record.id, error = %e, "skipping record with corrupt content blob"),
            }
        }
        Ok(results)
    }

    /// Remove every record of `relative_path` together with its blobs.
    pub async fn invalidate(&self, relative_path: &str) -> Result<usize> {
        let records = self.records_for_path(relative_path).await?;
        for record in &records {
            self.remove_record(record).await?;
        }
        if !records.is_empty() {
            debug!(path = relative_path, removed = records.len(), "invalidated file records");
        }
        Ok(records.len())
    }

    /// Remove the records of `relative_path` whose id is not in `keep`.
    pub async fn retain_for_path(&self, relative_path: &str, keep: &HashSet<String>) -> Result<usize> {
        let mut removed = 0;
        for record in self.records_for_path(relative_path).await? {
            if !keep.contains(&record.id) {
                self.remove_record(&record).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove the records of every path not in `paths`.
    pub async fn prune_paths_except(&self, paths: &HashSet<String>) -> Result<usize> {
        let stored: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT relative_path FROM records ORDER BY relative_path")
                .fetch_all(&self.pool)
                .await?;
        let mut removed = 0;
        for path in stored.iter().filter(|p| !paths.contains(*p)) {
            removed += self.invalidate(path).await?;
        }
        Ok(removed)
    }

    pub async fn records_for_path(&self, relative_path: &str) -> Result<Vec<VectorRecord>> {
        self.select_where("relative_path = ?1", &[relative_path.to_string()])
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<VectorRecord>> {
        Ok(self
            .select_where("id = ?1", &[id.to_string()])
            .await?
            .into_iter()
            .next())
    }

    /// Whether `id` is stored with a vector from `provider`.
    pub async fn contains(&self, id: &str, provider: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM records WHERE id = ?1 AND provider = ?2")
                .bind(id)
                .bind(provider)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    pub async fn all_records(&self) -> Result<Vec<VectorRecord>> {
        self.select_filtered(&QueryFilter::default()).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let records = self.all_records().await?;
        let mut stats = StoreStats {
            records: records.len(),
            ..StoreStats::default()
        };
        let mut files = HashSet::new();
        for record in &records {
            files.insert(record.relative_path.as_str());
            if record.metadata.truncated {
                stats.truncated += 1;
            }
            *stats
                .by_language
                .entry(record.metadata.language.clone())
                .or_default() += 1;
            *stats
                .by_chunk_type
                .entry(record.metadata.chunk_type.to_string())
                .or_default() += 1;
            *stats
                .by_provider
                .entry(record.metadata.provider.clone())
                .or_default() += 1;
        }
        stats.files = files.len();
        Ok(stats)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let target = path.display().to_string();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::write(&target, e))?;
    }
    let temp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&temp, bytes)
        .await
        .map_err(|e| StoreError::write(&target, e))?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(StoreError::write(target, e));
    }
    Ok(())
}

pub fn cosine_similarity(a: &[f16], b: &[f16]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (x.to_f32(), y.to_f32());
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a.sqrt() * norm_b.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn embedded(path: &str, start_line: usize, content: &str, vector: &[f32], provider: &str) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: TextChunk {
                repo: "repo".to_string(),
                file_path: format!("/repo/{path}"),
                relative_path: path.to_string(),
                sequence: 0,
                start_line,
                end_line: start_line + 2,
                start_byte: 0,
                end_byte: content.len(),
                chunk_type: ChunkType::Function,
                language: if path.ends_with(".py") { "python" } else { "rust" }.to_string(),
                function_name: Some(format!("f{start_line}")),
                class_name: None,
                imports: vec![],
                context_before: vec![],
                context_after: vec![],
                references: vec![],
                content: content.to_string(),
                byte_size: content.len(),
                token_estimate: content.len().div_ceil(4),
            },
            vector: vector.iter().map(|&v| f16::from_f32(v)).collect(),
            provider: provider.to_string(),
            embedded_at: Utc::now(),
            truncated: false,
        }
    }

    fn record(path: &str, start_line: usize, content: &str, vector: &[f32]) -> NewRecord {
        NewRecord::new(embedded(path, start_line, content, vector, "p1"), Utc::now())
    }

    fn query_vector(values: &[f32]) -> Vec<f16> {
        values.iter().map(|&v| f16::from_f32(v)).collect()
    }

    #[tokio::test]
    async fn test_empty_store_query() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = VectorStore::open(dir.path()).await?;
        let results = store.query(&query_vector(&[1.0, 0.0]), 5, &QueryFilter::default()).await?;
        assert!(results.is_empty());
        assert_eq!(store.stats().await?, StoreStats::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = VectorStore::open(dir.path()).await?;

        let first = store.upsert(vec![record("src/a.rs", 1, "fn a() {}", &[1.0, 0.0])]).await?;
        assert_eq!(first.inserted, 1);
        let again = store.upsert(vec![record("src/a.rs", 1, "fn a() {}", &[1.0, 0.0])]).await?;
        assert_eq!(again, UpsertSummary { unchanged: 1, ..Default::default() });

        let records = store.all_records().await?;
        assert_eq!(records.len(), 1);
        assert!(records[0].vector_path.exists());
        assert!(records[0].content_path.exists());
        assert!(records[0].vector_path.starts_with(dir.path().join("blobs").join(&records[0].id[..2])));
        Ok(())
    }

    #[tokio::test]
    async fn test_changed_content_replaces_slot() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = VectorStore::open(dir.path()).await?;

        store.upsert(vec![record("src/a.rs", 1, "fn a() {}", &[1.0, 0.0])]).await?;
        let old = store.all_records().await?.remove(0);

        let summary = store.upsert(vec![record("src/a.rs", 1, "fn a() { 1 }", &[0.0, 1.0])]).await?;
        assert_eq!(summary.replaced, 1);

        let records = store.all_records().await?;
        assert_eq!(records.len(), 1);
        assert_ne!(records[0].id, old.id);
        assert!(!old.vector_path.exists());
        assert!(!old.content_path.exists());
        assert!(store.get(&old.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_provider_migration_in_place() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = VectorStore::open(dir.path()).await?;
        store.upsert(vec![record("src/a.rs", 1, "fn a() {}", &[1.0, 0.0])]).await?;

        let migrated = NewRecord::new(
            embedded("src/a.rs", 1, "fn a() {}", &[0.0, 0.0, 1.0], "p2"),
            Utc::now(),
        );
        let id = migrated.id();
        let summary = store.upsert(vec![migrated]).await?;
        assert_eq!(summary.migrated, 1);

        let stored = store.get(&id).await?.unwrap();
        assert_eq!(stored.metadata.provider, "p2");
        assert_eq!(stored.metadata.dimension, 3);
        assert_eq!(store.load_vector(&stored).await?, query_vector(&[0.0, 0.0, 1.0]));
        assert!(store.contains(&id, "p2").await?);
        assert!(!store.contains(&id, "p1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_top_k_in_descending_order() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = VectorStore::open(dir.path()).await?;
        store
            .upsert(vec![
                record("src/a.rs", 1, "exact", &[1.0, 0.0]),
                record("src/a.rs", 10, "close", &[0.8, 0.6]),
                record("src/a.rs", 20, "middle", &[0.6, 0.8]),
                record("src/a.rs", 30, "orthogonal", &[0.0, 1.0]),
                record("src/a.rs", 40, "opposite", &[-1.0, 0.0]),
            ])
            .await?;

        let results = store.query(&query_vector(&[1.0, 0.0]), 3, &QueryFilter::default()).await?;
        let contents: Vec<&str> = results.iter().map(|r| r.chunk.content.as_str()).collect();
        assert_eq!(contents, vec!["exact", "close", "middle"]);
        assert!(results.windows(2).all(|pair| pair[0].score > pair[1].score));
        assert!((results[0].score - 1.0).abs() < 1e-3);
        Ok(())
    }

    #[tokio::test]
    async fn test_ties_prefer_recent_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = VectorStore::open(dir.path()).await?;
        let now = Utc::now();
        store
            .upsert(vec![
                NewRecord::new(embedded("src/old.rs", 1, "old", &[1.0, 0.0], "p1"), now - Duration::days(3)),
                NewRecord::new(embedded("src/new.rs", 1, "new", &[1.0, 0.0], "p1"), now),
            ])
            .await?;

        let results = store.query(&query_vector(&[1.0, 0.0]), 2, &QueryFilter::default()).await?;
        assert_eq!(results[0].chunk.content, "new");
        assert_eq!(results[1].chunk.content, "old");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_corrupt_blob_is_skipped() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = VectorStore::open(dir.path()).await?;
        store
            .upsert(vec![
                record("src/a.rs", 1, "healthy", &[1.0, 0.0]),
                record("src/b.rs", 1, "broken", &[1.0, 0.0]),
                record("src/c.rs", 1, "missing", &[0.9, 0.1]),
            ])
            .await?;

        let broken = store.records_for_path("src/b.rs").await?.remove(0);
        tokio::fs::write(&broken.vector_path, b"\x01").await?;
        let missing = store.records_for_path("src/c.rs").await?.remove(0);
        tokio::fs::remove_file(&missing.content_path).await?;

        let results = store.query(&query_vector(&[1.0, 0.0]), 5, &QueryFilter::default()).await?;
        let contents: Vec<&str> = results.iter().map(|r| r.chunk.content.as_str()).collect();
        assert_eq!(contents, vec!["healthy"]);
        assert!(logs_contain("skipping record with corrupt vector blob"));
        assert!(logs_contain("skipping record with corrupt content blob"));
        Ok(())
    }

    #[tokio::test]
    async fn test_filters() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = VectorStore::open(dir.path()).await?;
        store
            .upsert(vec![
                record("src/a.rs", 1, "rust", &[1.0, 0.0]),
                record("lib/b.py", 1, "python", &[1.0, 0.0]),
                record("src_extra/c.rs", 1, "other", &[1.0, 0.0]),
            ])
            .await?;
        let query = query_vector(&[1.0, 0.0]);

        let python = store.query(&query, 10, &QueryFilter::new().with_language("python")).await?;
        assert_eq!(python.len(), 1);
        assert_eq!(python[0].chunk.content, "python");

        let under_src = store.query(&query, 10, &QueryFilter::new().with_path_prefix("src/")).await?;
        assert_eq!(under_src.len(), 1);
        assert_eq!(under_src[0].record.relative_path, "src/a.rs");

        let classes = store
            .query(&query, 10, &QueryFilter::new().with_chunk_type(ChunkType::Class))
            .await?;
        assert!(classes.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalidate_retain_and_prune() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = VectorStore::open(dir.path()).await?;
        store
            .upsert(vec![
                record("src/a.rs", 1, "a1", &[1.0, 0.0]),
                record("src/a.rs", 10, "a2", &[1.0, 0.0]),
                record("src/b.rs", 1, "b1", &[1.0, 0.0]),
                record("src/c.rs", 1, "c1", &[1.0, 0.0]),
            ])
            .await?;

        let a_records = store.records_for_path("src/a.rs").await?;
        let keep: HashSet<String> = [a_records[0].id.clone()].into_iter().collect();
        assert_eq!(store.retain_for_path("src/a.rs", &keep).await?, 1);
        assert!(!a_records[1].vector_path.exists());

        assert_eq!(store.invalidate("src/b.rs").await?, 1);
        assert!(store.records_for_path("src/b.rs").await?.is_empty());
        assert_eq!(store.invalidate("src/missing.rs").await?, 0);

        let live: HashSet<String> = ["src/a.rs".to_string()].into_iter().collect();
        assert_eq!(store.prune_paths_except(&live).await?, 1);

        let stats = store.stats().await?;
        assert_eq!((stats.records, stats.files), (1, 1));
        assert_eq!(stats.by_provider.get("p1"), Some(&1));
        Ok(())
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = VectorStore::open(dir.path()).await?;
        store.upsert(vec![record("src/a.rs", 1, "fn a() {}", &[1.0, 0.0])]).await?;

        let shard = store.all_records().await?[0].vector_path.parent().unwrap().to_path_buf();
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&shard).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.ends_with(".vec") || n.ends_with(".json")));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_no_blobs() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = VectorStore::open(dir.path()).await?;
        sqlx::query(
            "CREATE TRIGGER reject_inserts BEFORE INSERT ON records BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(store.pool())
        .await?;

        let result = store.upsert(vec![record("src/a.rs", 1, "fn a() {}", &[1.0, 0.0])]).await;
        assert!(result.is_err());
        assert!(store.all_records().await?.is_empty());

        let mut blobs = Vec::new();
        let mut pending = vec![dir.path().join("blobs")];
        while let Some(path) = pending.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&path).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    pending.push(entry.path());
                } else {
                    blobs.push(entry.path());
                }
            }
        }
        assert!(blobs.is_empty(), "{blobs:?}");
        Ok(())
    }

    #[test]
    fn test_cosine_similarity() {
        let a = query_vector(&[1.0, 0.0]);
        assert_eq!(cosine_similarity(&a, &query_vector(&[1.0, 0.0])), 1.0);
        assert_eq!(cosine_similarity(&a, &query_vector(&[0.0, 1.0])), 0.0);
        assert_eq!(cosine_similarity(&a, &query_vector(&[-1.0, 0.0])), -1.0);
        assert_eq!(cosine_similarity(&a, &query_vector(&[0.0, 0.0])), 0.0);
        assert_eq!(cosine_similarity(&a, &query_vector(&[1.0, 0.0, 0.0])), 0.0);
    }
}
