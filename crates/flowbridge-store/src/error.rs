//! Error types for the storage layer.

/// Errors that can occur during queue, mapping or submission operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database operation failed.
    #[error("store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A phone number could not be normalized.
    #[error("invalid phone number: {0}")]
    InvalidPhone(String),
}
