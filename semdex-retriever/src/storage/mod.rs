//! Persistent state for an index directory.
//!
//! Everything lives under one directory (by default `<repo>/.semdex`):
//!
//! ```text
//! <index_dir>/
//!   index.db                 SQLite: records, jobs, repositories
//!   blobs/<id[0..2]>/<id>.vec   little-endian f16 vector
//!   blobs/<id[0..2]>/<id>.json  chunk text and metadata
//! ```
//!
//! - [`vector_store::VectorStore`]: vector records and similarity queries
//! - [`job_store::JobStore`]: processing jobs and registered repositories

use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use std::path::{Path, PathBuf};

pub mod job_store;
pub mod vector_store;

pub use job_store::JobStore;
pub use vector_store::{
    NewRecord, QueryFilter, RecordMetadata, ScoredRecord, StoreStats, UpsertSummary, VectorRecord,
    VectorStore,
};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The index directory or database could not be opened
    #[error("Failed to open index at {path}: {message}")]
    Open { path: PathBuf, message: String },

    /// A blob or row could not be written
    #[error("Failed to write {target}: {message}")]
    WriteFailure { target: String, message: String },

    /// A stored blob is missing or unreadable
    #[error("Corrupt record {id}: {message}")]
    Corruption { id: String, message: String },

    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },
}

impl StoreError {
    pub fn write(target: impl Into<String>, message: impl ToString) -> Self {
        Self::WriteFailure {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn corruption(id: impl Into<String>, message: impl ToString) -> Self {
        Self::Corruption {
            id: id.into(),
            message: message.to_string(),
        }
    }

    /// Stable code used in job error reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Open { .. } => "store_open_failure",
            Self::WriteFailure { .. } => "store_write_failure",
            Self::Corruption { .. } => "store_corruption",
            Self::Database { .. } => "store_database_failure",
        }
    }
}

/// Content fingerprint of a chunk: blake3 over path, line range and content.
///
/// Stable across runs exactly when all three are unchanged.
pub fn fingerprint(relative_path: &str, start_line: usize, end_line: usize, content: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(relative_path.as_bytes());
    hasher.update(&[0]);
    hasher.update(format!("{start_line}-{end_line}").as_bytes());
    hasher.update(&[0]);
    hasher.update(content.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Open (creating if needed) `<index_dir>/index.db`.
pub async fn open_pool(index_dir: &Path) -> Result<SqlitePool> {
    tokio::fs::create_dir_all(index_dir)
        .await
        .map_err(|e| StoreError::Open {
            path: index_dir.to_path_buf(),
            message: e.to_string(),
        })?;

    SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(index_dir.join("index.db"))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true),
    )
    .await
    .map_err(|e| StoreError::Open {
        path: index_dir.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_stability() {
        let a = fingerprint("src/lib.rs", 1, 5, "fn main() {}");
        assert_eq!(a, fingerprint("src/lib.rs", 1, 5, "fn main() {}"));
        assert_eq!(a.len(), 64);

        assert_ne!(a, fingerprint("src/lib.rs", 2, 6, "fn main() {}"));
        assert_ne!(a, fingerprint("src/main.rs", 1, 5, "fn main() {}"));
        assert_ne!(a, fingerprint("src/lib.rs", 1, 5, "fn main() { }"));
        // The separators keep "1-5" + "1" distinct from "1-51".
        assert_ne!(fingerprint("a", 1, 5, "1x"), fingerprint("a", 1, 51, "x"));
    }
}
