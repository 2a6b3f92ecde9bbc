use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the scan, selection and PCA-cache machinery.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("Position {position} not found on contig {contig}")]
    PositionNotFound { contig: String, position: i64 },
    #[error("Corrupt cache entry {fingerprint} ({}): {reason}", path.display())]
    CacheCorrupt {
        fingerprint: String,
        path: PathBuf,
        reason: String,
    },
    #[error("No sites left for analysis: {0}")]
    EmptySelection(String),
    #[error("Malformed input {}: {reason}", path.display())]
    MalformedInput { path: PathBuf, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScanError {
    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ScanError::MalformedInput {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        ScanError::ShapeMismatch(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ScanError::InvalidParameter(msg.into())
    }
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;
