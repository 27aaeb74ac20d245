//! Storage error types.

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A read or write against the backend failed.
    #[error("storage error: {0}")]
    Internal(String),

    /// The backend could not be opened.
    #[error("connection error: {0}")]
    Connection(String),

    /// The namespace or key is not acceptable.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
