use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::SyncError;

const SIDECAR_SUFFIX: &str = ".sdr";
const METADATA_EXTENSION: &str = ".lua";
const METADATA_MARKER: &str = "metadata";

/// A metadata file found on the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Stem of the enclosing `Book.sdr` directory, used when the file has
    /// no title of its own.
    pub fallback_title: Option<String>,
}

impl SourceFile {
    pub fn new(path: PathBuf) -> Self {
        let fallback_title = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(SIDECAR_SUFFIX))
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Self { path, fallback_title }
    }
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Every metadata file to sync. Fails before anything is read when
    /// access is refused or the run is cancelled.
    async fn locate(&self, cancel: &CancellationToken) -> Result<Vec<SourceFile>, SyncError>;
}

pub fn is_metadata_file(name: &str) -> bool {
    let name = name.to_lowercase();
    name.ends_with(METADATA_EXTENSION) && name.contains(METADATA_MARKER)
}

/// Recursive walk of a KOReader directory (a device mount, a copy of its
/// `.sdr` folders or a book library with sidecars).
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn walk(root: &Path, cancel: &CancellationToken) -> Result<Vec<SourceFile>, SyncError> {
        match std::fs::read_dir(root) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(SyncError::PermissionDenied(root.to_path_buf()));
            }
            Err(e) => {
                return Err(SyncError::SourceUnavailable {
                    path: root.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(root).to_path_buf();
                    if e.io_error().map(|io| io.kind()) == Some(ErrorKind::PermissionDenied) {
                        return Err(SyncError::PermissionDenied(path));
                    }
                    tracing::warn!(path = ?path, error = %e, "skipping unreadable entry");
                    continue;
                }
            };

            if entry.file_type().is_file() && entry.file_name().to_str().is_some_and(is_metadata_file) {
                files.push(SourceFile::new(entry.into_path()));
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl SourceProvider for DirectorySource {
    async fn locate(&self, cancel: &CancellationToken) -> Result<Vec<SourceFile>, SyncError> {
        let root = self.root.clone();
        let token = cancel.clone();
        let files = tokio::task::spawn_blocking(move || Self::walk(&root, &token))
            .await
            .map_err(|e| SyncError::SourceUnavailable {
                path: self.root.clone(),
                reason: e.to_string(),
            })??;

        tracing::info!(root = ?self.root, files = files.len(), "located metadata files");
        Ok(files)
    }
}
