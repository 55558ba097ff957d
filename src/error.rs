//! Crate-level error types.
//!
//! User-visible coordinator failures (validation, not-found, invalid
//! transitions) are distinct variants so embedders can map them to synchronous
//! API responses, while storage and event failures wrap the underlying module
//! errors.

use uuid::Uuid;

use crate::events::publisher::PublishError;
use crate::storage::StorageError;

/// Errors surfaced by the public coordinator API and engine internals.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("batch not found: {0}")]
    BatchNotFound(Uuid),

    #[error("duplicate batch: {0}")]
    DuplicateBatch(Uuid),

    #[error("invalid state transition: cannot {event} from {from}")]
    InvalidTransition { from: String, event: String },

    #[error("auth context required: credentials are not persisted and must be supplied")]
    AuthRequired,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("event error: {0}")]
    Event(#[from] PublishError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DispatchError::Validation("empty recipient list".to_string());
        assert_eq!(err.to_string(), "validation error: empty recipient list");

        let err = DispatchError::InvalidTransition {
            from: "completed".to_string(),
            event: "pause".to_string(),
        };
        assert!(err.to_string().contains("cannot pause from completed"));
    }
}
