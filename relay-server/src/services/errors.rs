use shared::models::ValidationError;
use thiserror::Error;

use crate::log_store::LogStoreError;

/// Failures surfaced by the relay core.
///
/// `NotFound` covers missing, soft-deleted, and foreign-tenant conversations
/// alike so existence never leaks across tenants.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RelayError {
    /// Missing, deleted, or owned by another tenant.
    #[error("conversation not found")]
    NotFound,
    /// Input rejected before anything was written.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    /// The log store did not accept a record.
    #[error("publish failed: {0}")]
    Publish(#[source] LogStoreError),
    /// History could not be read.
    #[error("replay failed: {0}")]
    Replay(#[source] LogStoreError),
    /// The provider failed or the attempt was cancelled.
    #[error("generation failed: {reason}")]
    Generation { reason: String, cancelled: bool },
    /// The client connection is gone.
    #[error("client transport closed")]
    Transport,
    /// A required collaborator is not configured.
    #[error("service unavailable: {0}")]
    Unavailable(&'static str),
}

impl RelayError {
    pub fn generation(reason: impl Into<String>) -> Self {
        Self::Generation {
            reason: reason.into(),
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self::Generation {
            reason: "generation cancelled".to_string(),
            cancelled: true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Generation { cancelled: true, .. })
    }
}

/// Result alias for relay core calls.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_a_generation_failure() {
        let err = RelayError::cancelled();
        assert!(err.is_cancelled());
        assert!(!RelayError::generation("boom").is_cancelled());
        assert_eq!(RelayError::generation("boom").to_string(), "generation failed: boom");
    }

    #[test]
    fn validation_errors_convert() {
        let err: RelayError = ValidationError::EmptyContent.into();
        assert!(matches!(err, RelayError::Validation(ValidationError::EmptyContent)));
    }
}
