//! # highway-protocol
//!
//! Binary invocation codec for the highway RPC transport.
//!
//! This crate provides:
//! - Framing with a message id and explicit header/body length prefixes
//! - Request and response header encoding with propagated context
//! - Schema-driven, protobuf-compatible body encoding with default backfill
//! - A per-operation schema registry keyed by operation identity and status
//!
//! Everything here is synchronous and performs no I/O.

pub mod body;
pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod invocation;
pub mod schema;
pub mod value;

pub use body::{Arguments, RequestBodySchema, ResponseBodySchema};
pub use codec::{Decoder, Encoder};
pub use error::{ErrorKind, ProtocolError};
pub use frame::{
    assemble_request, assemble_response, split_frame, Frame, FrameWriter, FRAME_PREFIX_SIZE, MAGIC,
};
pub use header::{ContextMap, MsgType, RequestHeader, ResponseHeader};
pub use invocation::{Invocation, Response};
pub use schema::{status, OperationId, OperationSchema, OperationSchemaBuilder, SchemaRegistry};
pub use value::{FieldSpec, FieldType, MessageType, PrimitiveKind, Value};

/// Default port for highway servers.
pub const DEFAULT_PORT: u16 = 7070;

/// Maximum frame size, header plus body (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
