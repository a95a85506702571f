//! Engine error types.

use keel_state::StateError;
use thiserror::Error;

/// Errors surfaced by engine operations.
///
/// Everything except [`EngineError::Store`] is a definitive rejection and is
/// never retried.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("store error: {0}")]
    Store(#[from] StateError),

    /// An external collaborator (provisioner, deploy hook) reported failure.
    #[error("external failure: {0}")]
    External(String),
}

impl EngineError {
    /// Only store-level lock contention is safe to retry.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
