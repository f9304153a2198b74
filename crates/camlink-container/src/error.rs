//! Container parsing errors

use thiserror::Error;

/// Result type alias for container operations
pub type ContainerResult<T> = Result<T, ContainerError>;

#[derive(Debug, Error)]
pub enum ContainerError {
    /// The marker-delimited container's magic marker is missing
    #[error("Container marker not found")]
    MarkerNotFound,

    #[error("Invalid container header: {0}")]
    InvalidHeader(String),

    #[error("File not found in container: {name}")]
    FileNotFound { name: String },

    /// Recomputed SHA-256 differs from the declared digest
    #[error("Integrity check failed for {name}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Size mismatch for {name}: declared {expected} bytes, extracted {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Unsupported manifest version {0} (supported: 4, 5)")]
    UnsupportedManifestVersion(u64),

    #[error("Unknown image type '{0}'")]
    UnknownImageType(String),

    /// A cpio entry header did not start with the newc magic
    #[error("Bad archive magic '{found}'")]
    BadMagic { found: String },

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ContainerError {
    /// Check if this error means the image bytes are corrupt
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ContainerError::IntegrityMismatch { .. } | ContainerError::SizeMismatch { .. }
        )
    }
}
