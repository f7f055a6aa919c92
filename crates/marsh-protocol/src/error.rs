//! Error types for marsh-protocol.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or parsing protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame payload is not a valid message.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The handshake line could not be parsed.
    #[error("invalid endpoint line: {0:?}")]
    InvalidEndpoint(String),

    /// Transport failure below the framing layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
