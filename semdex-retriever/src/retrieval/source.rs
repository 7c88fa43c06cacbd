//! The file stream fed to indexing jobs.

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory holding the index; never indexed itself.
pub const INDEX_DIR_NAME: &str = ".semdex";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceFile {
    pub absolute_path: PathBuf,
    /// Forward-slash path relative to the repository root
    pub relative_path: String,
    pub language_hint: Option<String>,
}

impl SourceFile {
    pub fn new(absolute_path: PathBuf, relative_path: impl Into<String>) -> Self {
        Self {
            absolute_path,
            relative_path: relative_path.into(),
            language_hint: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language_hint = Some(language.into());
        self
    }

    /// A file under `root`, with its relative path derived from `absolute_path`.
    pub fn under(root: &Path, absolute_path: PathBuf) -> Self {
        let relative_path = relative_path(root, &absolute_path);
        Self::new(absolute_path, relative_path)
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk `root` honoring `.gitignore`, `.ignore` and hidden-file rules.
///
/// Files over `max_file_bytes` are skipped. Results are sorted by relative path.
pub fn discover(root: &Path, max_file_bytes: u64) -> Vec<SourceFile> {
    let mut files = Vec::new();
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .filter_entry(|entry| entry.file_name() != INDEX_DIR_NAME)
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > max_file_bytes {
            debug!(path = %entry.path().display(), size, "skipping large file");
            continue;
        }
        files.push(SourceFile::under(root, entry.into_path()));
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_discover_respects_ignore_rules() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/nested"))?;
        std::fs::create_dir_all(root.join("target"))?;
        std::fs::create_dir_all(root.join(INDEX_DIR_NAME))?;
        std::fs::write(root.join(".gitignore"), "target/\n")?;
        std::fs::write(root.join("src/main.rs"), "fn main() {}")?;
        std::fs::write(root.join("src/nested/util.py"), "def f(): pass")?;
        std::fs::write(root.join("target/out.rs"), "fn built() {}")?;
        std::fs::write(root.join(INDEX_DIR_NAME).join("index.db"), "")?;
        std::fs::write(root.join("big.txt"), "x".repeat(200))?;

        let files = discover(root, 100);
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["src/main.rs", "src/nested/util.py"]);
        assert_eq!(files[0].absolute_path, root.join("src/main.rs"));
        Ok(())
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let file = SourceFile::under(Path::new("/repo"), PathBuf::from("/repo/a/b/c.rs"));
        assert_eq!(file.relative_path, "a/b/c.rs");
        assert_eq!(file.language_hint, None);
    }
}
