//! Shared error types for message construction and decoding.

use thiserror::Error;

/// Errors raised while building, encoding or decoding a [`crate::Message`].
#[derive(Error, Debug)]
pub enum MessageError {
    /// A required envelope field is missing or empty.
    #[error("Invalid message: missing {0}")]
    Invalid(&'static str),

    /// The textual envelope could not be encoded or parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A packed array payload could not be decoded.
    #[error("Array payload error: {reason}")]
    Array {
        /// What was wrong with the payload.
        reason: String,
    },

    /// The base-64 body of a packed array was malformed.
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl MessageError {
    pub(crate) fn array(reason: impl Into<String>) -> Self {
        Self::Array {
            reason: reason.into(),
        }
    }
}

/// Alias for Result with MessageError.
pub type MessageResult<T> = Result<T, MessageError>;
