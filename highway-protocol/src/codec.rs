//! Encoder and decoder for highway invocations.
//!
//! [`Encoder`] composes header, body and frame for outbound messages.
//! [`Decoder`] buffers inbound stream bytes into frames, and turns frames
//! back into invocations and responses.

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameWriter};
use crate::header::{ContextMap, RequestHeader, ResponseHeader};
use crate::invocation::{Invocation, Response};
use crate::schema::OperationSchema;
use crate::MAX_FRAME_SIZE;
use bytes::{Bytes, BytesMut};

/// Encodes requests and responses into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes `invocation` as a request frame tagged with `msg_id`.
    pub fn encode_request(
        msg_id: u64,
        invocation: &Invocation,
        schema: &OperationSchema,
    ) -> Result<Bytes, ProtocolError> {
        if schema.id() != invocation.operation() {
            return Err(ProtocolError::SchemaNotFound(invocation.operation().clone()));
        }

        let header = invocation.to_request_header();
        let mut writer = FrameWriter::new(msg_id);
        writer.write_header(|buf| header.encode_into(buf));
        writer.write_body(|buf| schema.request().serialize_into(invocation.arguments(), buf))?;
        writer.finish()
    }

    /// Encodes `response` as a response frame, propagating `context`.
    ///
    /// Fails with `StatusSchemaNotFound` if `schema` has no body schema for
    /// the response's status.
    pub fn encode_response(
        msg_id: u64,
        schema: &OperationSchema,
        response: &Response,
        context: &ContextMap,
    ) -> Result<Bytes, ProtocolError> {
        let body_schema = schema.response(response.status)?;
        let header = response.to_header(context.clone());

        let mut writer = FrameWriter::new(msg_id);
        writer.write_header(|buf| header.encode_into(buf));
        writer.write_body(|buf| body_schema.serialize_into(response.body.as_ref(), buf))?;
        writer.finish()
    }
}

/// Decodes frames into invocations and responses.
pub struct Decoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Decoder rejecting frames that declare more than `max` bytes of header
    /// plus body, before their content is buffered. Capped at
    /// [`MAX_FRAME_SIZE`].
    pub fn with_max_frame_size(max: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_size: max.min(MAX_FRAME_SIZE),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode_with_limit(&mut self.buffer, self.max_frame_size)
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Decodes the request header of `frame`.
    pub fn read_request_header(frame: &Frame) -> Result<RequestHeader, ProtocolError> {
        RequestHeader::decode(&frame.header)
    }

    /// Decodes a request body into `invocation`.
    ///
    /// Arguments are backfilled with defaults unless the invocation crosses
    /// an edge, then the header's context is merged in. Nothing is written
    /// to `invocation` if the body fails to decode.
    pub fn decode_request(
        invocation: &mut Invocation,
        header: &RequestHeader,
        schema: &OperationSchema,
        body: &[u8],
    ) -> Result<(), ProtocolError> {
        let request = schema.request();
        let mut arguments = request.deserialize(body)?;
        if !invocation.is_edge() {
            request.backfill_defaults(&mut arguments);
        }

        invocation.set_arguments(arguments);
        invocation.merge_context(&header.context);
        Ok(())
    }

    /// Decodes a response frame for `invocation`.
    ///
    /// The body schema is chosen by the header's status code; the body is
    /// decoded into the invocation's expected type for that status when one
    /// is set. The wire context is merged as soon as the header decodes, so
    /// it reaches the invocation even when the body cannot be read.
    pub fn decode_response(
        invocation: &mut Invocation,
        schema: &OperationSchema,
        frame: &Frame,
    ) -> Result<Response, ProtocolError> {
        if schema.id() != invocation.operation() {
            return Err(ProtocolError::SchemaNotFound(invocation.operation().clone()));
        }

        let header = ResponseHeader::decode(&frame.header)?;
        if !header.context.is_empty() {
            invocation.merge_context(&header.context);
        }

        let body_schema = schema.response(header.status_code)?;
        let expected = invocation.expected_type(header.status_code);
        let body = body_schema.deserialize(&frame.body, expected)?;
        Ok(Response::from_header(header, body))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
