use crate::types::{ContentHash, FileId};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CortexError>;

#[derive(Debug, Error)]
pub enum CortexError {
    #[error("File not found: {0}")]
    NotFound(FileId),

    #[error("Write conflict on {id}: expected hash {expected}, found {}", display_hash(.actual))]
    Conflict {
        id: FileId,
        expected: ContentHash,
        actual: Option<ContentHash>,
    },

    #[error("Unresolved merge markers in {id} (first at line {line})")]
    MergeMarkersPresent { id: FileId, line: usize },

    #[error("Timed out after {waited:?} waiting for the write lock on {id}")]
    LockTimeout { id: FileId, waited: Duration },

    #[error("Path rejected: {path}: {reason}")]
    PathRejected { path: String, reason: String },

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("Circular transclusion: {}", format_stack(.stack))]
    CircularDependency { stack: Vec<FileId> },

    #[error("Transclusion depth exceeded at {id} (max depth {max_depth})")]
    DepthExceeded { id: FileId, max_depth: usize },

    #[error("Version {version} of {id} is not in the retained history")]
    RollbackTargetMissing { id: FileId, version: u64 },

    #[error("File too large: {id} is {size} bytes (limit {limit})")]
    FileTooLarge { id: FileId, size: u64, limit: u64 },

    #[error("Rate limited: no capacity within {waited:?}")]
    RateLimited { waited: Duration },

    #[error("File is not valid UTF-8: {0}")]
    InvalidEncoding(FileId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl CortexError {
    pub(crate) fn rejected(path: impl Into<String>, reason: impl Into<String>) -> Self {
        CortexError::PathRejected {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether a caller may reasonably retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            CortexError::LockTimeout { .. } | CortexError::RateLimited { .. } => true,
            CortexError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }
}

/// I/O kinds worth retrying locally before surfacing.
pub(crate) fn is_transient_io(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

fn display_hash(hash: &Option<ContentHash>) -> String {
    match hash {
        Some(h) => h.to_string(),
        None => "<absent>".to_string(),
    }
}

fn format_stack(stack: &[FileId]) -> String {
    stack
        .iter()
        .map(FileId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
