//! Error taxonomy shared by every layer of the coordinator.

use thiserror::Error;

/// Result alias used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by run transitions, queue handling and event processing.
///
/// Validation errors (`NotFound`, `Conflict`, `InvalidTransition`,
/// `InvalidInput`) are never retried. `Transient` failures are redelivered
/// with backoff, `Permanent` failures go straight to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl CoreError {
    /// Whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }

    /// Whether this is a caller-side validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::NotFound(_)
                | CoreError::Conflict(_)
                | CoreError::InvalidTransition(_)
                | CoreError::InvalidInput(_)
        )
    }

    /// Short machine-readable name, used as `error_type` on error events.
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::InvalidTransition(_) => "invalid_transition",
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::Transient(_) => "transient",
            CoreError::Permanent(_) => "permanent",
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Permanent(format!("malformed payload: {}", err))
    }
}
