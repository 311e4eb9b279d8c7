//! Error types for event and payload handling.

use thiserror::Error;

/// Errors that can occur when decoding events or wire payloads.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EventError {
    /// The payload is structurally valid JSON but semantically invalid.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
