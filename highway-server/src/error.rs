//! Server error types.

use highway_protocol::{status, ErrorKind, ProtocolError, Response, Value};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("metrics setup failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Codec error kind, for protocol errors.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ServerError::Protocol(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// Returns whether the connection that raised this error must be closed.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            ServerError::Io(_) | ServerError::ShuttingDown => true,
            ServerError::Protocol(e) => e.kind().is_connection_fatal(),
            ServerError::Metrics(_) => false,
        }
    }
}

/// Failure returned by an operation handler.
///
/// Becomes a response carrying `status`, `reason` and `body`, so the status
/// must have a registered response schema on the operation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("service error {status}: {reason}")]
pub struct ServiceError {
    pub status: u32,
    pub reason: String,
    pub body: Option<Value>,
}

impl ServiceError {
    pub fn new(status: u32, reason: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            status,
            reason: reason.into(),
            body,
        }
    }

    /// Provider-side failure; the message travels as the string body.
    pub fn provider_fault(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            status::PROVIDER_FAULT,
            "Provider Fault",
            Some(Value::String(message)),
        )
    }

    /// Rejection of the consumer's input.
    pub fn consumer_fault(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            status::CONSUMER_FAULT,
            "Consumer Fault",
            Some(Value::String(message)),
        )
    }

    pub fn into_response(self) -> Response {
        Response::new(self.status, self.reason, self.body)
    }
}
