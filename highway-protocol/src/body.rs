//! Schema-driven body codec.
//!
//! Bodies use protobuf-compatible tagged encoding. Optional fields holding
//! their type's zero value are not written, so the request decoder has to
//! backfill those parameters before arguments reach application code.
//!
//! ```text
//! request body  = { param_1 = tag 1, param_2 = tag 2, ... }
//! response body = { result = tag 1 }        (empty for void operations)
//! ```

use crate::error::ProtocolError;
use crate::value::{FieldSpec, FieldType, MessageType, PrimitiveKind, Value};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};
use std::collections::BTreeMap;

/// Decoded arguments, keyed by parameter name.
pub type Arguments = BTreeMap<String, Value>;

/// Tag of the single field carried by a response body.
const RESULT_TAG: u32 = 1;

/// Serializer and deserializer for one operation's request body.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBodySchema {
    params: MessageType,
}

impl RequestBodySchema {
    pub fn new(params: MessageType) -> Self {
        Self { params }
    }

    /// Declared parameters, in declaration order.
    pub fn params(&self) -> &[FieldSpec] {
        self.params.fields()
    }

    /// Serializes arguments into `buf`.
    ///
    /// On error `buf` may hold a partial body; [`crate::FrameWriter`] cuts it
    /// back off.
    pub fn serialize_into(
        &self,
        args: &Arguments,
        buf: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        encode_message(&self.params, args, buf)
    }

    pub fn serialize(&self, args: &Arguments) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.serialize_into(args, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Deserializes a request body. Only parameters present on the wire are
    /// returned; see [`RequestBodySchema::backfill_defaults`].
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Arguments, ProtocolError> {
        decode_message(&self.params, bytes)
    }

    /// Inserts the zero value of every optional primitive parameter missing
    /// from `args`. Returns the number of parameters inserted.
    ///
    /// Nullable parameters are left absent, absent means null for them.
    pub fn backfill_defaults(&self, args: &mut Arguments) -> usize {
        let mut inserted = 0;
        for param in self.params.fields() {
            if param.required {
                continue;
            }
            let Some(kind) = param.ty.primitive() else {
                continue;
            };
            if args.get(&param.name).map_or(true, Value::is_null) {
                tracing::trace!(param = %param.name, kind = kind.name(), "backfilling default");
                args.insert(param.name.clone(), kind.zero());
                inserted += 1;
            }
        }
        inserted
    }
}

/// Serializer and deserializer for one operation's response body under a
/// single status code.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseBodySchema {
    ty: Option<FieldType>,
}

impl ResponseBodySchema {
    pub fn new(ty: FieldType) -> Self {
        Self { ty: Some(ty) }
    }

    /// Schema of an operation that returns nothing.
    pub fn void() -> Self {
        Self { ty: None }
    }

    /// Declared body type; `None` for void.
    pub fn ty(&self) -> Option<&FieldType> {
        self.ty.as_ref()
    }

    pub fn serialize_into(
        &self,
        value: Option<&Value>,
        buf: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        let value = value.filter(|v| !v.is_null());
        match (&self.ty, value) {
            (_, None) => Ok(()),
            (None, Some(v)) => Err(ProtocolError::serialization(format!(
                "void response cannot carry a {} body",
                v.type_name()
            ))),
            (Some(ty), Some(v)) => encode_entry("result", RESULT_TAG, ty, false, v, buf),
        }
    }

    pub fn serialize(&self, value: Option<&Value>) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.serialize_into(value, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Deserializes a response body into `expected`, falling back to the
    /// declared type. An absent primitive result decodes to its zero value.
    pub fn deserialize(
        &self,
        bytes: &[u8],
        expected: Option<&FieldType>,
    ) -> Result<Option<Value>, ProtocolError> {
        let Some(ty) = expected.or(self.ty.as_ref()) else {
            return Ok(None);
        };

        let (element, repeated) = split_repeated(ty);
        let mut buf = bytes;
        let mut result: Option<Value> = None;
        while buf.has_remaining() {
            let (tag, wire_type) = decode_key(&mut buf)?;
            if tag != RESULT_TAG {
                skip_field(wire_type, &mut buf)?;
                continue;
            }
            let value = decode_value(element, wire_type, &mut buf)?;
            if repeated {
                push_repeated(&mut result, value);
            } else {
                result = Some(value);
            }
        }

        Ok(result.or_else(|| ty.primitive().map(PrimitiveKind::zero)))
    }
}

fn wire_type_of(ty: &FieldType) -> WireType {
    match ty {
        FieldType::Primitive(PrimitiveKind::Float) => WireType::ThirtyTwoBit,
        FieldType::Primitive(PrimitiveKind::Double) => WireType::SixtyFourBit,
        FieldType::Primitive(_) => WireType::Varint,
        FieldType::String | FieldType::Bytes | FieldType::Message(_) => WireType::LengthDelimited,
        FieldType::Repeated(element) => wire_type_of(element),
    }
}

fn split_repeated(ty: &FieldType) -> (&FieldType, bool) {
    match ty {
        FieldType::Repeated(element) => (element, true),
        other => (other, false),
    }
}

fn push_repeated(slot: &mut Option<Value>, value: Value) {
    match slot {
        Some(Value::List(items)) => items.push(value),
        _ => *slot = Some(Value::List(vec![value])),
    }
}

fn primitive_accepts(kind: PrimitiveKind, value: &Value) -> bool {
    matches!(
        (kind, value),
        (PrimitiveKind::Int32, Value::Int32(_))
            | (PrimitiveKind::Int64, Value::Int64(_) | Value::Int32(_))
            | (PrimitiveKind::Float, Value::Float(_))
            | (PrimitiveKind::Double, Value::Double(_) | Value::Float(_))
            | (PrimitiveKind::Bool, Value::Bool(_))
    )
}

fn encode_message(
    message: &MessageType,
    values: &BTreeMap<String, Value>,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if let Some(unknown) = values
        .keys()
        .find(|name| !message.fields().iter().any(|f| &f.name == *name))
    {
        return Err(ProtocolError::serialization(format!(
            "{} has no field '{}'",
            message.name, unknown
        )));
    }

    for field in message.fields() {
        match values.get(&field.name).filter(|v| !v.is_null()) {
            Some(value) => {
                encode_entry(&field.name, field.tag, &field.ty, field.required, value, buf)?
            }
            None if field.required => {
                return Err(ProtocolError::serialization(format!(
                    "required field '{}' of {} is missing",
                    field.name, message.name
                )))
            }
            None => {}
        }
    }
    Ok(())
}

fn encode_entry(
    name: &str,
    tag: u32,
    ty: &FieldType,
    required: bool,
    value: &Value,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    match (ty, value) {
        (FieldType::Repeated(element), Value::List(items)) => {
            for item in items {
                encode_value(name, tag, element, item, buf)?;
            }
            Ok(())
        }
        (FieldType::Primitive(kind), v) if !required && v.is_zero() => {
            if primitive_accepts(*kind, v) {
                Ok(())
            } else {
                Err(mismatch(name, ty, v))
            }
        }
        _ => encode_value(name, tag, ty, value, buf),
    }
}

fn encode_value(
    name: &str,
    tag: u32,
    ty: &FieldType,
    value: &Value,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    match (ty, value) {
        (FieldType::Primitive(PrimitiveKind::Int32), Value::Int32(v)) => {
            encode_key(tag, WireType::Varint, buf);
            // Negative int32 is sign-extended to ten bytes, as protobuf does.
            encode_varint(*v as i64 as u64, buf);
        }
        (FieldType::Primitive(PrimitiveKind::Int64), Value::Int64(v)) => {
            encode_key(tag, WireType::Varint, buf);
            encode_varint(*v as u64, buf);
        }
        (FieldType::Primitive(PrimitiveKind::Int64), Value::Int32(v)) => {
            encode_key(tag, WireType::Varint, buf);
            encode_varint(*v as i64 as u64, buf);
        }
        (FieldType::Primitive(PrimitiveKind::Bool), Value::Bool(v)) => {
            encode_key(tag, WireType::Varint, buf);
            encode_varint(u64::from(*v), buf);
        }
        (FieldType::Primitive(PrimitiveKind::Float), Value::Float(v)) => {
            encode_key(tag, WireType::ThirtyTwoBit, buf);
            buf.put_f32_le(*v);
        }
        (FieldType::Primitive(PrimitiveKind::Double), Value::Double(v)) => {
            encode_key(tag, WireType::SixtyFourBit, buf);
            buf.put_f64_le(*v);
        }
        (FieldType::Primitive(PrimitiveKind::Double), Value::Float(v)) => {
            encode_key(tag, WireType::SixtyFourBit, buf);
            buf.put_f64_le(f64::from(*v));
        }
        (FieldType::String, Value::String(s)) => {
            encode_key(tag, WireType::LengthDelimited, buf);
            encode_varint(s.len() as u64, buf);
            buf.put_slice(s.as_bytes());
        }
        (FieldType::Bytes, Value::Bytes(b)) => {
            encode_key(tag, WireType::LengthDelimited, buf);
            encode_varint(b.len() as u64, buf);
            buf.put_slice(b);
        }
        (FieldType::Message(message), Value::Message(fields)) => {
            let mut nested = BytesMut::new();
            encode_message(message, fields, &mut nested)?;
            encode_key(tag, WireType::LengthDelimited, buf);
            encode_varint(nested.len() as u64, buf);
            buf.put_slice(&nested);
        }
        (FieldType::Repeated(_), Value::List(_)) => {
            return Err(ProtocolError::serialization(format!(
                "field '{}': nested repeated values are not supported",
                name
            )))
        }
        (ty, v) => return Err(mismatch(name, ty, v)),
    }
    Ok(())
}

fn mismatch(name: &str, ty: &FieldType, value: &Value) -> ProtocolError {
    ProtocolError::serialization(format!(
        "field '{}' expects {}, got {}",
        name,
        ty.describe(),
        value.type_name()
    ))
}

fn decode_message(
    message: &MessageType,
    bytes: &[u8],
) -> Result<BTreeMap<String, Value>, ProtocolError> {
    let mut values = BTreeMap::new();
    let mut buf = bytes;

    while buf.has_remaining() {
        let (tag, wire_type) = decode_key(&mut buf)?;
        let Some(field) = message.field_by_tag(tag) else {
            skip_field(wire_type, &mut buf)?;
            continue;
        };

        let (element, repeated) = split_repeated(&field.ty);
        let value = decode_value(element, wire_type, &mut buf)?;
        if repeated {
            let mut slot = values.remove(&field.name);
            push_repeated(&mut slot, value);
            if let Some(list) = slot {
                values.insert(field.name.clone(), list);
            }
        } else {
            values.insert(field.name.clone(), value);
        }
    }

    if let Some(missing) = message
        .fields()
        .iter()
        .find(|f| f.required && !values.contains_key(&f.name))
    {
        return Err(ProtocolError::serialization(format!(
            "required field '{}' of {} is missing",
            missing.name, message.name
        )));
    }

    Ok(values)
}

fn decode_value(
    ty: &FieldType,
    wire_type: WireType,
    buf: &mut &[u8],
) -> Result<Value, ProtocolError> {
    let expected = wire_type_of(ty);
    if wire_type != expected {
        return Err(ProtocolError::serialization(format!(
            "wire type {:?} does not match declared {}",
            wire_type,
            ty.describe()
        )));
    }

    let value = match ty {
        FieldType::Primitive(PrimitiveKind::Int32) => Value::Int32(decode_varint(buf)? as i32),
        FieldType::Primitive(PrimitiveKind::Int64) => Value::Int64(decode_varint(buf)? as i64),
        FieldType::Primitive(PrimitiveKind::Bool) => Value::Bool(decode_varint(buf)? != 0),
        FieldType::Primitive(PrimitiveKind::Float) => {
            let mut raw = take(buf, 4)?;
            Value::Float(raw.get_f32_le())
        }
        FieldType::Primitive(PrimitiveKind::Double) => {
            let mut raw = take(buf, 8)?;
            Value::Double(raw.get_f64_le())
        }
        FieldType::String => {
            let raw = take_delimited(buf)?;
            let s = std::str::from_utf8(raw)
                .map_err(|_| ProtocolError::serialization("invalid UTF-8 in string field"))?;
            Value::String(s.to_string())
        }
        FieldType::Bytes => Value::Bytes(Bytes::copy_from_slice(take_delimited(buf)?)),
        FieldType::Message(message) => {
            let raw = take_delimited(buf)?;
            Value::Message(decode_message(message, raw)?)
        }
        FieldType::Repeated(_) => {
            return Err(ProtocolError::serialization(
                "nested repeated values are not supported",
            ))
        }
    };
    Ok(value)
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], ProtocolError> {
    if buf.len() < len {
        return Err(ProtocolError::serialization(format!(
            "field needs {} bytes, {} left",
            len,
            buf.len()
        )));
    }
    let data: &'a [u8] = *buf;
    let (head, tail) = data.split_at(len);
    *buf = tail;
    Ok(head)
}

fn take_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], ProtocolError> {
    let len = decode_varint(buf)?;
    let len = usize::try_from(len)
        .map_err(|_| ProtocolError::serialization("length prefix overflows usize"))?;
    take(buf, len)
}

fn skip_field(wire_type: WireType, buf: &mut &[u8]) -> Result<(), ProtocolError> {
    match wire_type {
        WireType::Varint => {
            decode_varint(buf)?;
        }
        WireType::SixtyFourBit => {
            take(buf, 8)?;
        }
        WireType::ThirtyTwoBit => {
            take(buf, 4)?;
        }
        WireType::LengthDelimited => {
            take_delimited(buf)?;
        }
        WireType::StartGroup | WireType::EndGroup => {
            return Err(ProtocolError::serialization("group encoding is not supported"))
        }
    }
    Ok(())
}
