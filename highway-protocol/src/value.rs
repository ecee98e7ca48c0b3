//! Declared types and decoded values carried in message bodies.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Primitive kinds whose zero value the body encoding omits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Int32,
    Int64,
    Float,
    Double,
    Bool,
}

impl PrimitiveKind {
    /// Zero value for this kind.
    pub fn zero(self) -> Value {
        match self {
            PrimitiveKind::Int32 => Value::Int32(0),
            PrimitiveKind::Int64 => Value::Int64(0),
            PrimitiveKind::Float => Value::Float(0.0),
            PrimitiveKind::Double => Value::Double(0.0),
            PrimitiveKind::Bool => Value::Bool(false),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Int32 => "int32",
            PrimitiveKind::Int64 => "int64",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Double => "double",
            PrimitiveKind::Bool => "bool",
        }
    }
}

/// Declared type of a parameter, field or return value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Primitive(PrimitiveKind),
    String,
    Bytes,
    Message(Arc<MessageType>),
    Repeated(Box<FieldType>),
}

impl FieldType {
    pub fn int32() -> Self {
        FieldType::Primitive(PrimitiveKind::Int32)
    }

    pub fn int64() -> Self {
        FieldType::Primitive(PrimitiveKind::Int64)
    }

    pub fn float() -> Self {
        FieldType::Primitive(PrimitiveKind::Float)
    }

    pub fn double() -> Self {
        FieldType::Primitive(PrimitiveKind::Double)
    }

    pub fn bool() -> Self {
        FieldType::Primitive(PrimitiveKind::Bool)
    }

    pub fn message(message: MessageType) -> Self {
        FieldType::Message(Arc::new(message))
    }

    pub fn repeated(element: FieldType) -> Self {
        FieldType::Repeated(Box::new(element))
    }

    /// Returns the primitive kind, if this is a primitive type.
    pub fn primitive(&self) -> Option<PrimitiveKind> {
        match self {
            FieldType::Primitive(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Human-readable type name for error messages.
    pub fn describe(&self) -> String {
        match self {
            FieldType::Primitive(kind) => kind.name().to_string(),
            FieldType::String => "string".to_string(),
            FieldType::Bytes => "bytes".to_string(),
            FieldType::Message(message) => message.name.clone(),
            FieldType::Repeated(element) => format!("repeated {}", element.describe()),
        }
    }
}

/// One declared field of a message, or one declared parameter of an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    /// Wire tag, unique within the enclosing message.
    pub tag: u32,
    pub ty: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, tag: u32, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            tag,
            ty,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A named, ordered set of fields.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageType {
    pub name: String,
    fields: Vec<FieldSpec>,
}

impl MessageType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field, tagged with its declaration position.
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        let tag = self.fields.len() as u32 + 1;
        self.fields.push(FieldSpec::new(name, tag, ty));
        self
    }

    /// Appends a required field, tagged with its declaration position.
    pub fn required_field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        let tag = self.fields.len() as u32 + 1;
        self.fields.push(FieldSpec::new(name, tag, ty).required());
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field_by_tag(&self, tag: u32) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.tag == tag)
    }
}

/// A decoded (or to-be-encoded) body value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    String(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Message(BTreeMap<String, Value>),
}

impl Value {
    /// Returns whether this value is the zero value of a primitive kind.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Int32(v) => *v == 0,
            Value::Int64(v) => *v == 0,
            Value::Float(v) => *v == 0.0,
            Value::Double(v) => *v == 0.0,
            Value::Bool(v) => !*v,
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Message(fields) => Some(fields),
            _ => None,
        }
    }

    /// Short name of the value's shape, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Message(_) => "message",
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}
