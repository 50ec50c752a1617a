//! Error types for the shoal cluster store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl StateError {
    /// Whether retrying the same transaction may succeed.
    ///
    /// Only failures to begin or commit a transaction qualify; record-level
    /// errors (missing keys, bad payloads) fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }
}
