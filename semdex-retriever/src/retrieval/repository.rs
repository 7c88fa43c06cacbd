use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A repository known to the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    /// blake3 over the canonical path and remote URL
    pub id: String,
    pub path: PathBuf,
    pub remote_url: Option<String>,
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl RepositoryInfo {
    /// Describe the repository at `path`. The path is canonicalized when it exists.
    pub fn new(path: &Path, remote_url: Option<String>, branch: Option<String>) -> Self {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let now = Utc::now();
        Self {
            id: Self::identity(&path, remote_url.as_deref()),
            path,
            remote_url,
            branch,
            created_at: now,
            updated_at: now,
            last_accessed: now,
        }
    }

    pub fn identity(canonical_path: &Path, remote_url: Option<&str>) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(canonical_path.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        hasher.update(remote_url.unwrap_or_default().as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Display name: the last path component.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}
