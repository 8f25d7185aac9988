use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Another referral already carries this external payment reference.
    #[error("payment reference already attributed: {0}")]
    DuplicatePaymentReference(String),

    /// A guarded commit found the document in a different state than expected.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether a retry of the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}
