//! # LLM Error Types
//!
//! Error types for generation providers.

use thiserror::Error;

/// Result type alias for LLM operations
pub type LLMResult<T> = Result<T, LLMError>;

/// Errors raised by a generation provider.
#[derive(Error, Debug)]
pub enum LLMError {
    /// Provider is missing credentials or is otherwise misconfigured
    #[error("Invalid configuration: {field} - {message}")]
    InvalidConfiguration {
        /// Offending setting.
        field: String,
        /// Explanation.
        message: String,
    },

    /// The HTTP request could not be sent or the connection dropped
    #[error("Provider request failed: {message}")]
    Request {
        /// Transport error text.
        message: String,
    },

    /// The provider answered with a non-success status
    #[error("Provider returned status {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or provider error message.
        message: String,
    },

    /// The response stream was malformed or reported an error mid-stream
    #[error("Text generation failed: {reason}")]
    GenerationFailed {
        /// Explanation.
        reason: String,
    },

    /// Generation was stopped by the caller
    #[error("generation cancelled")]
    Cancelled,

    /// Input validation error
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Explanation.
        message: String,
    },
}

impl LLMError {
    /// Create a new invalid configuration error
    pub fn invalid_config<T: Into<String>, U: Into<String>>(field: T, message: U) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new generation failed error
    pub fn generation_failed<T: Into<String>>(reason: T) -> Self {
        Self::GenerationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new invalid input error
    pub fn invalid_input<T: Into<String>>(message: T) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Whether the error reflects a caller-initiated stop rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for LLMError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for LLMError {
    fn from(error: serde_json::Error) -> Self {
        Self::GenerationFailed {
            reason: format!("malformed stream payload: {error}"),
        }
    }
}
