//! Request and response headers.
//!
//! Headers are encoded independently of the body so that a receiver can pick
//! the body schema from the header alone.
//!
//! ```text
//! request  = msg_type u8 | flags u32 | dest str | schema_id str | operation str | context map
//! response = status u32  | reason str | headers map | context map
//!
//! str = len u32 | utf-8 bytes
//! map = count u32 | (str, str) * count
//! ```

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Propagated string metadata (tracing ids, auth tokens, ...).
pub type ContextMap = HashMap<String, String>;

/// Message type tag of a request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MsgType {
    #[default]
    Request = 0,
    Login = 1,
}

impl TryFrom<u8> for MsgType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MsgType::Request),
            1 => Ok(MsgType::Login),
            _ => Err(ProtocolError::malformed(format!(
                "unknown message type: {}",
                value
            ))),
        }
    }
}

/// Header of a request frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub msg_type: MsgType,
    pub flags: u32,
    pub dest_microservice: String,
    pub schema_id: String,
    pub operation_name: String,
    pub context: ContextMap,
}

impl RequestHeader {
    /// Encodes the header into a standalone buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.msg_type as u8);
        buf.put_u32(self.flags);
        put_str(buf, &self.dest_microservice);
        put_str(buf, &self.schema_id);
        put_str(buf, &self.operation_name);
        put_map(buf, &self.context);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = bytes;
        let msg_type = MsgType::try_from(get_u8(&mut buf, "msg_type")?)?;
        let flags = get_u32(&mut buf, "flags")?;
        let dest_microservice = get_str(&mut buf, "dest_microservice")?;
        let schema_id = get_str(&mut buf, "schema_id")?;
        let operation_name = get_str(&mut buf, "operation_name")?;
        let context = get_map(&mut buf, "context")?;
        expect_end(buf)?;

        Ok(Self {
            msg_type,
            flags,
            dest_microservice,
            schema_id,
            operation_name,
            context,
        })
    }
}

/// Header of a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub status_code: u32,
    pub reason_phrase: String,
    /// Protocol-level headers (transport metadata).
    pub headers: HashMap<String, String>,
    pub context: ContextMap,
}

impl ResponseHeader {
    pub fn new(status_code: u32, reason_phrase: impl Into<String>) -> Self {
        Self {
            status_code,
            reason_phrase: reason_phrase.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = context;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.status_code);
        put_str(buf, &self.reason_phrase);
        put_map(buf, &self.headers);
        put_map(buf, &self.context);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = bytes;
        let status_code = get_u32(&mut buf, "status_code")?;
        let reason_phrase = get_str(&mut buf, "reason_phrase")?;
        let headers = get_map(&mut buf, "headers")?;
        let context = get_map(&mut buf, "context")?;
        expect_end(buf)?;

        Ok(Self {
            status_code,
            reason_phrase,
            headers,
            context,
        })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_map(buf: &mut BytesMut, map: &HashMap<String, String>) {
    buf.put_u32(map.len() as u32);
    for (key, value) in map {
        put_str(buf, key);
        put_str(buf, value);
    }
}

fn need(buf: &[u8], len: usize, field: &str) -> Result<(), ProtocolError> {
    if buf.len() < len {
        return Err(ProtocolError::malformed(format!(
            "{}: need {} bytes, {} left",
            field,
            len,
            buf.len()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8], field: &str) -> Result<u8, ProtocolError> {
    need(buf, 1, field)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8], field: &str) -> Result<u32, ProtocolError> {
    need(buf, 4, field)?;
    Ok(buf.get_u32())
}

fn get_str(buf: &mut &[u8], field: &str) -> Result<String, ProtocolError> {
    let len = get_u32(buf, field)? as usize;
    need(buf, len, field)?;
    let data: &[u8] = *buf;
    let (raw, rest) = data.split_at(len);
    let s = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::malformed(format!("{}: invalid UTF-8", field)))?
        .to_string();
    *buf = rest;
    Ok(s)
}

fn get_map(buf: &mut &[u8], field: &str) -> Result<HashMap<String, String>, ProtocolError> {
    let count = get_u32(buf, field)? as usize;
    // Each entry takes at least two length prefixes.
    need(buf, count.saturating_mul(8), field)?;
    let mut map = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = get_str(buf, field)?;
        let value = get_str(buf, field)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn expect_end(buf: &[u8]) -> Result<(), ProtocolError> {
    if !buf.is_empty() {
        return Err(ProtocolError::malformed(format!(
            "{} trailing bytes after header",
            buf.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    fn sample_request() -> RequestHeader {
        RequestHeader {
            msg_type: MsgType::Request,
            flags: 0,
            dest_microservice: "pojo".to_string(),
            schema_id: "schemaA".to_string(),
            operation_name: "sayHi".to_string(),
            context: HashMap::from([("trace-id".to_string(), "abc".to_string())]),
        }
    }

    #[test]
    fn test_request_header_roundtrip_empty_context() {
        let header = RequestHeader {
            context: HashMap::new(),
            ..sample_request()
        };
        let decoded = RequestHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.context.is_empty());
    }

    #[test]
    fn test_response_header_roundtrip() {
        let header = ResponseHeader::new(0, "OK")
            .with_header("x-transport", "highway")
            .with_context(HashMap::from([("k".to_string(), "v".to_string())]));
        assert_eq!(ResponseHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_duplicate_context_keys_last_wins() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        put_str(&mut buf, "");
        buf.put_u32(0);
        buf.put_u32(2);
        put_str(&mut buf, "k");
        put_str(&mut buf, "first");
        put_str(&mut buf, "k");
        put_str(&mut buf, "second");

        let header = ResponseHeader::decode(&buf).unwrap();
        assert_eq!(header.context.len(), 1);
        assert_eq!(header.context["k"], "second");
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        let encoded = sample_request().encode();
        for cut in [0, 1, 5, 9, encoded.len() - 1] {
            let err = RequestHeader::decode(&encoded[..cut]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedHeader, "cut at {}", cut);
        }
    }

    #[test]
    fn test_oversized_length_prefix_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u32(0);
        buf.put_u32(u32::MAX);
        let err = RequestHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHeader(_)));
    }

    #[test]
    fn test_huge_map_count_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        put_str(&mut buf, "OK");
        buf.put_u32(u32::MAX);
        let err = ResponseHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHeader(_)));
    }

    #[test]
    fn test_unknown_msg_type_is_malformed() {
        let mut encoded = BytesMut::from(&sample_request().encode()[..]);
        encoded[0] = 9;
        let err = RequestHeader::decode(&encoded).unwrap_err();
        assert!(err.to_string().contains("message type"));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut encoded = BytesMut::from(&sample_request().encode()[..]);
        encoded.put_u8(0xFF);
        assert!(RequestHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u32(2);
        buf.put_slice(&[0xC3, 0x28]);
        buf.put_u32(0);
        buf.put_u32(0);
        let err = ResponseHeader::decode(&buf).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    fn string_map() -> impl Strategy<Value = HashMap<String, String>> {
        proptest::collection::hash_map(".{0,12}", ".{0,24}", 0..6)
    }

    proptest! {
        #[test]
        fn prop_request_header_roundtrip(
            login in any::<bool>(),
            flags in any::<u32>(),
            dest in ".{0,16}",
            schema_id in ".{0,32}",
            operation in ".{0,16}",
            context in string_map(),
        ) {
            let header = RequestHeader {
                msg_type: if login { MsgType::Login } else { MsgType::Request },
                flags,
                dest_microservice: dest,
                schema_id,
                operation_name: operation,
                context,
            };
            prop_assert_eq!(RequestHeader::decode(&header.encode()).unwrap(), header);
        }

        #[test]
        fn prop_response_header_roundtrip(
            status in any::<u32>(),
            reason in ".{0,32}",
            headers in string_map(),
            context in string_map(),
        ) {
            let header = ResponseHeader {
                status_code: status,
                reason_phrase: reason,
                headers,
                context,
            };
            prop_assert_eq!(ResponseHeader::decode(&header.encode()).unwrap(), header);
        }
    }
}
