//! Call-side and reply-side objects populated by the codec.

use crate::body::Arguments;
use crate::header::{ContextMap, MsgType, RequestHeader, ResponseHeader};
use crate::schema::{status, OperationId};
use crate::value::{FieldType, Value};
use std::collections::HashMap;

/// One logical remote call.
///
/// The context is owned by the invocation and travels with it through
/// async code as an ordinary value; nothing in this crate reads or writes
/// context that was not handed over explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    operation: OperationId,
    flags: u32,
    context: ContextMap,
    arguments: Arguments,
    response_types: HashMap<u32, FieldType>,
    edge: bool,
}

impl Invocation {
    pub fn new(operation: OperationId) -> Self {
        Self {
            operation,
            flags: 0,
            context: ContextMap::new(),
            arguments: Arguments::new(),
            response_types: HashMap::new(),
            edge: false,
        }
    }

    /// Builds the provider-side invocation named by a decoded request header.
    ///
    /// Context and arguments start empty; [`crate::Decoder::decode_request`]
    /// fills them from the wire.
    pub fn from_request_header(header: &RequestHeader) -> Self {
        let mut invocation = Self::new(OperationId::new(
            header.dest_microservice.clone(),
            header.schema_id.clone(),
            header.operation_name.clone(),
        ));
        invocation.flags = header.flags;
        invocation
    }

    pub fn operation(&self) -> &OperationId {
        &self.operation
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Marks the call as crossing an edge that forwards payloads opaquely.
    /// Edge invocations skip default backfill.
    pub fn with_edge(mut self, edge: bool) -> Self {
        self.edge = edge;
        self
    }

    pub fn is_edge(&self) -> bool {
        self.edge
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    pub fn set_argument(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.arguments.insert(name.into(), value.into());
    }

    pub(crate) fn set_arguments(&mut self, arguments: Arguments) {
        self.arguments = arguments;
    }

    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    pub fn set_context(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.context.insert(key.into(), value.into());
    }

    /// Adds every entry of `wire` to the local context. Local keys absent
    /// from `wire` are kept; on collision the wire value wins.
    pub fn merge_context(&mut self, wire: &ContextMap) {
        for (key, value) in wire {
            self.context.insert(key.clone(), value.clone());
        }
    }

    /// Overrides the type a response body under `status` decodes into.
    pub fn expect_response(&mut self, status: u32, ty: FieldType) {
        self.response_types.insert(status, ty);
    }

    pub fn expected_type(&self, status: u32) -> Option<&FieldType> {
        self.response_types.get(&status)
    }

    /// Request header announcing this invocation on the wire.
    pub fn to_request_header(&self) -> RequestHeader {
        RequestHeader {
            msg_type: MsgType::Request,
            flags: self.flags,
            dest_microservice: self.operation.microservice.clone(),
            schema_id: self.operation.schema_id.clone(),
            operation_name: self.operation.operation.clone(),
            context: self.context.clone(),
        }
    }
}

/// Decoded reply to an [`Invocation`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u32,
    pub reason: String,
    pub headers: HashMap<String, String>,
    /// Decoded body; `None` for void results.
    pub body: Option<Value>,
}

impl Response {
    pub fn new(status: u32, reason: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: HashMap::new(),
            body,
        }
    }

    pub fn ok(body: Option<Value>) -> Self {
        Self::new(status::OK, "OK", body)
    }

    /// Provider fault carrying its reason as the string body.
    pub fn provider_fault(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            status::PROVIDER_FAULT,
            "Provider Fault",
            Some(Value::String(reason)),
        )
    }

    pub fn is_ok(&self) -> bool {
        status::is_success(self.status)
    }

    pub(crate) fn from_header(header: ResponseHeader, body: Option<Value>) -> Self {
        Self {
            status: header.status_code,
            reason: header.reason_phrase,
            headers: header.headers,
            body,
        }
    }

    /// Response header for this response with the given propagated context.
    pub fn to_header(&self, context: ContextMap) -> ResponseHeader {
        ResponseHeader {
            status_code: self.status,
            reason_phrase: self.reason.clone(),
            headers: self.headers.clone(),
            context,
        }
    }
}
