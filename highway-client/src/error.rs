//! Client error types.

use highway_protocol::{ErrorKind, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("login rejected: {status} - {reason}")]
    LoginRejected { status: u32, reason: String },
}

impl ClientError {
    /// Returns whether this error is retryable.
    ///
    /// Codec errors never are: the same request would fail the same way.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed
        )
    }

    /// Codec error kind, for protocol errors.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Protocol(e) => Some(e.kind()),
            _ => None,
        }
    }
}
