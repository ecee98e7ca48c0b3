//! Protocol error types and error kinds.

use crate::schema::OperationId;
use std::fmt;
use thiserror::Error;

/// Errors raised while framing, encoding or decoding highway messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("schema not found for operation {0}")]
    SchemaNotFound(OperationId),

    #[error("no response schema for status {status} on operation {operation}")]
    StatusSchemaNotFound { operation: OperationId, status: u32 },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("truncated frame: need {needed} more bytes")]
    TruncatedFrame { needed: usize },

    #[error("invalid magic bytes: expected 'HWAY', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedHeader(reason.into())
    }

    pub(crate) fn serialization(reason: impl Into<String>) -> Self {
        ProtocolError::Serialization(reason.into())
    }

    /// Returns the stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::SchemaNotFound(_) => ErrorKind::SchemaNotFound,
            ProtocolError::StatusSchemaNotFound { .. } => ErrorKind::StatusSchemaNotFound,
            ProtocolError::MalformedHeader(_)
            | ProtocolError::InvalidMagic(_)
            | ProtocolError::FrameTooLarge { .. } => ErrorKind::MalformedHeader,
            ProtocolError::TruncatedFrame { .. } => ErrorKind::TruncatedFrame,
            ProtocolError::Serialization(_) => ErrorKind::SerializationFailure,
        }
    }
}

impl From<prost::DecodeError> for ProtocolError {
    fn from(err: prost::DecodeError) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Stable error kinds, used as log fields and metric labels.
///
/// Kinds that indicate version skew between peers or a corrupt connection
/// must stay distinguishable from ordinary serialization failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SchemaNotFound,
    StatusSchemaNotFound,
    MalformedHeader,
    TruncatedFrame,
    SerializationFailure,
}

impl ErrorKind {
    /// Returns whether the owning connection should be closed.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ErrorKind::MalformedHeader | ErrorKind::TruncatedFrame)
    }

    /// Returns whether this error points at a schema or protocol mismatch
    /// between the two peers.
    pub fn is_version_skew(&self) -> bool {
        matches!(
            self,
            ErrorKind::SchemaNotFound | ErrorKind::StatusSchemaNotFound
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SchemaNotFound => "SCHEMA_NOT_FOUND",
            ErrorKind::StatusSchemaNotFound => "STATUS_SCHEMA_NOT_FOUND",
            ErrorKind::MalformedHeader => "MALFORMED_HEADER",
            ErrorKind::TruncatedFrame => "TRUNCATED_FRAME",
            ErrorKind::SerializationFailure => "SERIALIZATION_FAILURE",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
