//! File scanner for discovering receipt documents.
//!
//! This module walks the input directory and turns every supported document
//! into an upload task. Walking happens on a blocking thread and feeds a
//! bounded channel, so uploads start before the walk is finished.

use crate::models::{Batch, UploadTask};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Configuration for file scanning.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// File extensions to include (without the dot).
    pub extensions: Vec<String>,
    /// Match extensions regardless of case. Off by default: `.PNG` is skipped.
    pub case_insensitive: bool,
    /// File or directory names to skip.
    pub excludes: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["png", "jpg", "jpeg", "pdf"]
                .into_iter()
                .map(String::from)
                .collect(),
            case_insensitive: false,
            excludes: Vec::new(),
        }
    }
}

impl From<&crate::config::ScannerConfig> for ScanConfig {
    fn from(config: &crate::config::ScannerConfig) -> Self {
        Self {
            extensions: config.extensions.clone(),
            case_insensitive: config.case_insensitive,
            excludes: config.excludes.clone(),
        }
    }
}

/// Scanned file information.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Relative path from the input root
    pub path: String,
    /// File size in bytes
    pub size: u64,
}

/// File scanner for discovering documents.
#[derive(Debug, Clone)]
pub struct FileScanner {
    config: ScanConfig,
    root: PathBuf,
}

impl FileScanner {
    /// Create a new file scanner.
    pub fn new(root: PathBuf, config: ScanConfig) -> Self {
        Self { config, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan for all matching files.
    pub fn scan(&self) -> Result<Vec<ScannedFile>> {
        if !self.root.is_dir() {
            anyhow::bail!("{} is not a valid directory", self.root.display());
        }

        let mut files = Vec::new();
        for path in self.matching_paths() {
            let metadata = std::fs::metadata(&path)
                .with_context(|| format!("Failed to stat {}", path.display()))?;
            let rel_path = path.strip_prefix(&self.root).unwrap_or(&path);
            files.push(ScannedFile {
                path: rel_path.to_string_lossy().to_string(),
                size: metadata.len(),
            });
        }
        Ok(files)
    }

    /// Stream upload tasks for every matching file.
    ///
    /// The returned receiver closes once the walk is complete or `cancel`
    /// fires.
    pub fn stream_tasks(
        &self,
        batch: Batch,
        capacity: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<UploadTask> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let scanner = self.clone();

        tokio::task::spawn_blocking(move || {
            info!(
                "Searching for files with extensions {:?} in {}",
                scanner.config.extensions,
                scanner.root.display()
            );
            let mut found = 0usize;
            for path in scanner.matching_paths() {
                if cancel.is_cancelled() {
                    debug!("Scan cancelled after {} files", found);
                    break;
                }
                let task = batch.task_for(&scanner.root, &path);
                if tx.blocking_send(task).is_err() {
                    debug!("Upload stage closed; stopping scan");
                    break;
                }
                found += 1;
            }
            info!("Found {} files", found);
        });

        rx
    }

    /// Check if a file name has a supported extension.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        if self.config.case_insensitive {
            self.config
                .extensions
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(ext))
        } else {
            self.config.extensions.iter().any(|wanted| wanted == ext)
        }
    }

    /// Check if a name matches exclusion patterns.
    fn is_excluded(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        self.config.excludes.iter().any(|pattern| name == pattern.as_str())
    }

    /// Lazily walk the tree, yielding regular files with a supported extension.
    fn matching_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| entry.depth() == 0 || !self.is_excluded(entry))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Cannot read directory entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter(move |entry| self.matches(entry.path()))
            .map(DirEntry::into_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(names: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for name in names {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"x").unwrap();
        }
        dir
    }

    #[test]
    fn test_only_supported_extensions_are_scanned() {
        let dir = tree(&["a.png", "b.jpg", "c.txt", "d.jpeg", "sub/e.pdf", "notes"]);
        let scanner = FileScanner::new(dir.path().to_path_buf(), ScanConfig::default());

        let mut paths: Vec<String> = scanner.scan().unwrap().into_iter().map(|f| f.path).collect();
        paths.sort();
        let expected_nested = Path::new("sub").join("e.pdf").to_string_lossy().to_string();
        assert_eq!(paths, vec!["a.png", "b.jpg", "d.jpeg", expected_nested.as_str()]);
    }

    #[test]
    fn test_uppercase_extensions_skipped_by_default() {
        // Matching is case-sensitive unless explicitly relaxed.
        let dir = tree(&["upper.PNG", "lower.png"]);
        let strict = FileScanner::new(dir.path().to_path_buf(), ScanConfig::default());
        assert_eq!(strict.scan().unwrap().len(), 1);

        let relaxed = FileScanner::new(
            dir.path().to_path_buf(),
            ScanConfig {
                case_insensitive: true,
                ..ScanConfig::default()
            },
        );
        assert_eq!(relaxed.scan().unwrap().len(), 2);
    }

    #[test]
    fn test_excluded_directories_are_pruned() {
        let dir = tree(&["keep/a.png", "skip/b.png"]);
        let scanner = FileScanner::new(
            dir.path().to_path_buf(),
            ScanConfig {
                excludes: vec!["skip".to_string()],
                ..ScanConfig::default()
            },
        );
        let files = scanner.scan().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].path.ends_with("a.png"));
    }

    #[test]
    fn test_directory_named_like_a_document_is_ignored() {
        let dir = tree(&["folder.png/inner.txt"]);
        let scanner = FileScanner::new(dir.path().to_path_buf(), ScanConfig::default());
        assert!(scanner.scan().unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let scanner = FileScanner::new(PathBuf::from("/definitely/not/here"), ScanConfig::default());
        assert!(scanner.scan().is_err());
    }

    #[tokio::test]
    async fn test_stream_tasks_yields_keys_under_batch() {
        let dir = tree(&["a.png", "b.jpg", "c.txt"]);
        let scanner = FileScanner::new(dir.path().to_path_buf(), ScanConfig::default());
        let batch = Batch::new();

        let mut rx = scanner.stream_tasks(batch.clone(), 1, CancellationToken::new());
        let mut keys = Vec::new();
        while let Some(task) = rx.recv().await {
            keys.push(task.key);
        }
        assert_eq!(
            keys,
            vec![format!("{}/a.png", batch.id()), format!("{}/b.jpg", batch.id())]
        );
    }
}
