//! Error types for the keel state store.

use std::time::Duration;

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

    /// A referential or uniqueness constraint rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The writer slot could not be acquired in time.
    #[error("timed out after {0:?} waiting for write transaction")]
    Timeout(Duration),
}

impl StateError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Timeout(_))
    }
}
