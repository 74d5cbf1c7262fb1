pub mod parquet;

use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Arrow error: {0}")]
    Arrow(String),
    #[error("Serde error: {0}")]
    Serde(String),
    #[error("Invalid: {0}")]
    Invalid(String),
    #[error("Parquet error: {0}")]
    Parquet(String),
    /// The artifact does not exist on disk.
    #[error("Missing: {0}")]
    Missing(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
