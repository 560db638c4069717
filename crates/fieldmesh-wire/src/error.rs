//! Errors from the wire layer.

use fieldmesh_types::MessageError;
use thiserror::Error;

/// Errors from the wire layer.
///
/// Only startup surfaces these to callers; once an endpoint runs, faults are
/// logged and the affected message is dropped.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("Path rejected: {0}")]
    Path(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Alias for Result with WireError.
pub type WireResult<T> = Result<T, WireError>;
