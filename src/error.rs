use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a [`crate::store::BlockStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for StoreError {
    fn from(error: reqwest::Error) -> Self {
        StoreError::Request(error.to_string())
    }
}

/// A metadata file whose content is not a well formed KOReader table.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("ParseError at byte {offset}: {message}")]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Run-level failures. File and book level problems never surface here;
/// they are logged and counted in [`crate::sync::SyncReport`].
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("StoreQueryError: failed to query synced books")]
    StoreQuery(#[source] StoreError),
    #[error("StoreError")]
    Store(#[from] StoreError),
    #[error("StoreCorruption: {0}")]
    StoreCorruption(String),
    #[error("PermissionDenied: {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("SourceUnavailable: {}: {reason}", path.display())]
    SourceUnavailable { path: PathBuf, reason: String },
    #[error("ReentrancyRejected: a sync is already running")]
    ReentrancyRejected,
    #[error("Cancelled")]
    Cancelled,
}

impl SyncError {
    /// Errors raised before the first book was touched.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            SyncError::StoreQuery(_)
                | SyncError::PermissionDenied(_)
                | SyncError::SourceUnavailable { .. }
                | SyncError::Cancelled
        )
    }
}
