//! Per-operation schema registry.
//!
//! The registry is an explicitly constructed value, shared by reference
//! (usually behind an `Arc`) with whatever encodes or decodes frames.
//! Reads load an immutable snapshot without locking; writers publish a
//! whole new snapshot, so a reader never sees a half-registered operation.

use crate::body::{RequestBodySchema, ResponseBodySchema};
use crate::error::ProtocolError;
use crate::value::{FieldType, MessageType};
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Well-known response status codes.
pub mod status {
    /// The operation completed and the body holds its return value.
    pub const OK: u32 = 0;
    /// The consumer sent something the provider could not accept.
    pub const CONSUMER_FAULT: u32 = 490;
    /// The provider failed while handling the call.
    pub const PROVIDER_FAULT: u32 = 590;

    /// Returns whether `code` is in the success range.
    pub fn is_success(code: u32) -> bool {
        (200..300).contains(&code) || code == OK
    }
}

/// (microservice, schema id, operation) triple naming one remote method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId {
    pub microservice: String,
    pub schema_id: String,
    pub operation: String,
}

impl OperationId {
    pub fn new(
        microservice: impl Into<String>,
        schema_id: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            microservice: microservice.into(),
            schema_id: schema_id.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.microservice, self.schema_id, self.operation)
    }
}

/// Request schema plus one response schema per status code.
#[derive(Debug, Clone)]
pub struct OperationSchema {
    id: OperationId,
    request: RequestBodySchema,
    responses: BTreeMap<u32, ResponseBodySchema>,
}

impl OperationSchema {
    /// Starts building the schema of `id`.
    pub fn builder(id: OperationId) -> OperationSchemaBuilder {
        OperationSchemaBuilder {
            id,
            params: MessageType::new("args"),
            responses: BTreeMap::from([
                (
                    status::CONSUMER_FAULT,
                    ResponseBodySchema::new(FieldType::String),
                ),
                (
                    status::PROVIDER_FAULT,
                    ResponseBodySchema::new(FieldType::String),
                ),
            ]),
        }
    }

    pub fn id(&self) -> &OperationId {
        &self.id
    }

    pub fn request(&self) -> &RequestBodySchema {
        &self.request
    }

    /// Response schema registered for `status`.
    pub fn response(&self, status: u32) -> Result<&ResponseBodySchema, ProtocolError> {
        self.responses
            .get(&status)
            .ok_or_else(|| ProtocolError::StatusSchemaNotFound {
                operation: self.id.clone(),
                status,
            })
    }

    /// Status codes with a registered response schema.
    pub fn statuses(&self) -> impl Iterator<Item = u32> + '_ {
        self.responses.keys().copied()
    }
}

/// Builder for [`OperationSchema`].
///
/// Parameters get wire tags in declaration order. `String` fault bodies are
/// registered under [`status::CONSUMER_FAULT`] and [`status::PROVIDER_FAULT`]
/// unless overridden.
#[derive(Debug)]
pub struct OperationSchemaBuilder {
    id: OperationId,
    params: MessageType,
    responses: BTreeMap<u32, ResponseBodySchema>,
}

impl OperationSchemaBuilder {
    pub fn param(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.params = self.params.field(name, ty);
        self
    }

    pub fn required_param(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.params = self.params.required_field(name, ty);
        self
    }

    /// Declares the body type returned under [`status::OK`].
    pub fn returns(self, ty: FieldType) -> Self {
        self.response(status::OK, ResponseBodySchema::new(ty))
    }

    /// Declares that [`status::OK`] carries no body.
    pub fn returns_void(self) -> Self {
        self.response(status::OK, ResponseBodySchema::void())
    }

    pub fn response(mut self, status: u32, schema: ResponseBodySchema) -> Self {
        self.responses.insert(status, schema);
        self
    }

    pub fn build(self) -> OperationSchema {
        OperationSchema {
            id: self.id,
            request: RequestBodySchema::new(self.params),
            responses: self.responses,
        }
    }
}

type Snapshot = HashMap<OperationId, Arc<OperationSchema>>;

/// Maps operation identities to their schemas.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    snapshot: ArcSwap<Snapshot>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) one operation schema.
    pub fn register(&self, schema: OperationSchema) {
        let schema = Arc::new(schema);
        tracing::debug!(operation = %schema.id(), "registering operation schema");
        self.snapshot.rcu(|current| {
            let mut next = Snapshot::clone(current);
            next.insert(schema.id().clone(), Arc::clone(&schema));
            next
        });
    }

    /// Atomically replaces every registered schema.
    pub fn replace_all(&self, schemas: impl IntoIterator<Item = OperationSchema>) {
        let next: Snapshot = schemas
            .into_iter()
            .map(|s| (s.id().clone(), Arc::new(s)))
            .collect();
        tracing::info!(operations = next.len(), "publishing schema snapshot");
        self.snapshot.store(Arc::new(next));
    }

    pub fn lookup(&self, id: &OperationId) -> Result<Arc<OperationSchema>, ProtocolError> {
        self.snapshot
            .load()
            .get(id)
            .cloned()
            .ok_or_else(|| ProtocolError::SchemaNotFound(id.clone()))
    }

    /// Looks up the response schema of `id` under `status`.
    pub fn lookup_response(
        &self,
        id: &OperationId,
        status: u32,
    ) -> Result<ResponseBodySchema, ProtocolError> {
        self.lookup(id)?.response(status).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities of all registered operations, sorted.
    pub fn operations(&self) -> Vec<OperationId> {
        let mut ids: Vec<_> = self.snapshot.load().keys().cloned().collect();
        ids.sort();
        ids
    }
}
