//! Provider-side dispatch of decoded requests to operation handlers.

use crate::error::ServiceError;
use crate::metrics::Metrics;
use bytes::Bytes;
use highway_protocol::{
    status, ContextMap, Decoder, Encoder, ErrorKind, FieldType, Frame, FrameWriter, Invocation,
    MsgType, OperationId, OperationSchema, ProtocolError, RequestHeader, Response,
    ResponseBodySchema, SchemaRegistry, Value,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Operation implementation.
///
/// Receives the decoded invocation (arguments backfilled, wire context
/// merged) and may add context entries, which travel back on the response.
pub type Handler =
    Arc<dyn Fn(&mut Invocation) -> Result<Option<Value>, ServiceError> + Send + Sync>;

/// Maps operation identities to their handlers.
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: RwLock<HashMap<OperationId, Handler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, operation: OperationId, handler: F)
    where
        F: Fn(&mut Invocation) -> Result<Option<Value>, ServiceError> + Send + Sync + 'static,
    {
        tracing::debug!(operation = %operation, "registering handler");
        self.handlers.write().insert(operation, Arc::new(handler));
    }

    pub fn get(&self, operation: &OperationId) -> Option<Handler> {
        self.handlers.read().get(operation).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

/// Turns request frames into response frames.
pub struct RequestHandler {
    schemas: Arc<SchemaRegistry>,
    services: Arc<ServiceRegistry>,
    metrics: Option<Arc<Metrics>>,
}

impl RequestHandler {
    pub fn new(schemas: Arc<SchemaRegistry>, services: Arc<ServiceRegistry>) -> Self {
        Self {
            schemas,
            services,
            metrics: None,
        }
    }

    /// Sets the metrics instance for request tracking.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Handles one request frame and returns the encoded response frame.
    ///
    /// Only connection-fatal errors (an undecodable request header) are
    /// returned; every other failure becomes a fault response.
    pub fn handle_frame(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let header = match Decoder::read_request_header(frame) {
            Ok(header) => header,
            Err(e) => {
                self.record_error(e.kind());
                return Err(e);
            }
        };

        if header.msg_type == MsgType::Login {
            tracing::debug!(msg_id = frame.msg_id, "login acknowledged");
            return encode_standalone(
                frame.msg_id,
                &Response::ok(None),
                &ResponseBodySchema::void(),
                &ContextMap::new(),
            );
        }

        let start = Instant::now();
        let mut invocation = Invocation::from_request_header(&header);
        let operation = invocation.operation().to_string();
        if let Some(ref metrics) = self.metrics {
            metrics.requests_total.with_label_values(&[operation.as_str()]).inc();
        }

        let result = self.invoke(frame, &header, &mut invocation);
        let encoded = match result {
            Ok(encoded) => Ok(encoded),
            Err(e) => {
                self.record_error(e.kind());
                if e.kind().is_version_skew() {
                    tracing::warn!(operation = %operation, kind = %e.kind(), "{}", e);
                } else {
                    tracing::debug!(operation = %operation, kind = %e.kind(), "{}", e);
                }
                self.fault(frame.msg_id, &e.to_string(), invocation.context())
            }
        };

        if let Some(ref metrics) = self.metrics {
            metrics
                .request_duration
                .with_label_values(&[operation.as_str()])
                .observe(start.elapsed().as_secs_f64());
        }
        encoded
    }

    fn invoke(
        &self,
        frame: &Frame,
        header: &RequestHeader,
        invocation: &mut Invocation,
    ) -> Result<Bytes, ProtocolError> {
        let schema: Arc<OperationSchema> = self.schemas.lookup(invocation.operation())?;
        Decoder::decode_request(invocation, header, &schema, &frame.body)?;

        let Some(handler) = self.services.get(invocation.operation()) else {
            let reason = format!("no handler for operation {}", invocation.operation());
            tracing::warn!("{}", reason);
            return self.fault(frame.msg_id, &reason, invocation.context());
        };

        let response = match handler(invocation) {
            Ok(body) => Response::ok(body),
            Err(e) => {
                tracing::debug!(
                    operation = %invocation.operation(),
                    status = e.status,
                    "handler failed: {}",
                    e.reason
                );
                e.into_response()
            }
        };

        let encoded =
            Encoder::encode_response(frame.msg_id, &schema, &response, invocation.context())?;
        self.record_status(response.status);
        Ok(encoded)
    }

    /// Provider fault response carrying `reason` as its body.
    fn fault(
        &self,
        msg_id: u64,
        reason: &str,
        context: &ContextMap,
    ) -> Result<Bytes, ProtocolError> {
        self.record_status(status::PROVIDER_FAULT);
        encode_standalone(
            msg_id,
            &Response::provider_fault(reason),
            &ResponseBodySchema::new(FieldType::String),
            context,
        )
    }

    fn record_status(&self, code: u32) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .responses_total
                .with_label_values(&[code.to_string().as_str()])
                .inc();
        }
    }

    fn record_error(&self, kind: ErrorKind) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .codec_errors_total
                .with_label_values(&[kind.as_str()])
                .inc();
        }
    }
}

/// Encodes a response without an operation schema.
fn encode_standalone(
    msg_id: u64,
    response: &Response,
    body_schema: &ResponseBodySchema,
    context: &ContextMap,
) -> Result<Bytes, ProtocolError> {
    let header = response.to_header(context.clone());
    let mut writer = FrameWriter::new(msg_id);
    writer.write_header(|buf| header.encode_into(buf));
    writer.write_body(|buf| body_schema.serialize_into(response.body.as_ref(), buf))?;
    writer.finish()
}
