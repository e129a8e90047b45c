//! Error types for alert payload validation.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while parsing or validating inbound alert payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Payload could not be decoded as an alert batch.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Payload decoded but violates a structural rule.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}
