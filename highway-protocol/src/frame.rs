//! Binary frame format.
//!
//! Frame layout (20 bytes prefix + header + body):
//!
//! ```text
//! +--------+---------+-----------+------------+
//! | magic  | msg_id  | total_len | header_len |
//! | 4 bytes| 8 bytes |  4 bytes  |  4 bytes   |
//! +--------+---------+-----------+------------+
//! | header               | body               |
//! | header_len bytes     | total - header_len |
//! +----------------------+--------------------+
//! ```
//!
//! Both length prefixes are explicit, so a receiver can split header from
//! body without parsing either.

use crate::error::ProtocolError;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying highway frames: "HWAY"
pub const MAGIC: [u8; 4] = *b"HWAY";

/// Size of the fixed frame prefix in bytes (4+8+4+4 = 20).
pub const FRAME_PREFIX_SIZE: usize = 20;

const TOTAL_LEN_OFFSET: usize = 12;
const HEADER_LEN_OFFSET: usize = 16;

/// A split frame: message id, header section and body section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlates a response with its request on a multiplexed connection.
    pub msg_id: u64,
    pub header: Bytes,
    pub body: Bytes,
}

impl Frame {
    pub fn new(msg_id: u64, header: Bytes, body: Bytes) -> Self {
        Self {
            msg_id,
            header,
            body,
        }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut writer = FrameWriter::new(self.msg_id);
        writer.write_header(|buf| buf.put_slice(&self.header));
        writer.write_body(|buf| {
            buf.put_slice(&self.body);
            Ok(())
        })?;
        writer.finish()
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        Self::decode_with_limit(buf, MAX_FRAME_SIZE)
    }

    /// Like [`Frame::decode`], but rejects any frame whose declared length
    /// exceeds `max_len` as soon as the prefix is buffered.
    pub fn decode_with_limit(
        buf: &mut BytesMut,
        max_len: usize,
    ) -> Result<Option<Self>, ProtocolError> {
        let max_len = max_len.min(MAX_FRAME_SIZE);
        if buf.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let msg_id = u64::from_be_bytes([
            buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
        ]);
        let total_len = read_u32(buf, TOTAL_LEN_OFFSET) as usize;
        let header_len = read_u32(buf, HEADER_LEN_OFFSET) as usize;

        if total_len > max_len {
            return Err(ProtocolError::FrameTooLarge {
                size: total_len,
                max: max_len,
            });
        }
        if header_len > total_len {
            return Err(ProtocolError::malformed(format!(
                "header length {} exceeds frame length {}",
                header_len, total_len
            )));
        }

        if buf.len() < FRAME_PREFIX_SIZE + total_len {
            return Ok(None);
        }

        buf.advance(FRAME_PREFIX_SIZE);
        let header = buf.split_to(header_len).freeze();
        let body = buf.split_to(total_len - header_len).freeze();

        Ok(Some(Self {
            msg_id,
            header,
            body,
        }))
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Number of bytes still missing before `raw` holds a complete frame.
fn bytes_needed(raw: &[u8]) -> usize {
    if raw.len() < FRAME_PREFIX_SIZE {
        return FRAME_PREFIX_SIZE - raw.len();
    }
    let total_len = read_u32(raw, TOTAL_LEN_OFFSET) as usize;
    (FRAME_PREFIX_SIZE + total_len).saturating_sub(raw.len())
}

/// Accumulates one outbound frame.
///
/// The prefix is reserved up front and patched by [`FrameWriter::finish`].
/// Dropping the writer without finishing releases the buffer, so a body
/// serializer failing halfway never leaks partial bytes to the connection.
#[derive(Debug)]
pub struct FrameWriter {
    buf: BytesMut,
    header_len: usize,
}

impl FrameWriter {
    pub fn new(msg_id: u64) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(&MAGIC);
        buf.put_u64(msg_id);
        buf.put_u32(0);
        buf.put_u32(0);
        Self { buf, header_len: 0 }
    }

    /// Writes the header section. Must be called before the body.
    pub fn write_header(&mut self, encode: impl FnOnce(&mut BytesMut)) {
        let start = self.buf.len();
        encode(&mut self.buf);
        self.header_len = self.buf.len() - start;
    }

    /// Writes the body section through a serializer that may fail.
    ///
    /// On failure the buffer is cut back to the end of the header, so no
    /// partial body survives.
    pub fn write_body<F>(&mut self, serialize: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut BytesMut) -> Result<(), ProtocolError>,
    {
        let start = self.buf.len();
        serialize(&mut self.buf).inspect_err(|_| self.buf.truncate(start))
    }

    /// Patches the length prefixes and hands out the finished frame.
    pub fn finish(mut self) -> Result<Bytes, ProtocolError> {
        let total_len = self.buf.len() - FRAME_PREFIX_SIZE;
        if total_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_len,
                max: MAX_FRAME_SIZE,
            });
        }

        self.buf[TOTAL_LEN_OFFSET..HEADER_LEN_OFFSET]
            .copy_from_slice(&(total_len as u32).to_be_bytes());
        self.buf[HEADER_LEN_OFFSET..FRAME_PREFIX_SIZE]
            .copy_from_slice(&(self.header_len as u32).to_be_bytes());
        Ok(self.buf.freeze())
    }
}

/// Assembles a request frame from already-encoded sections.
pub fn assemble_request(msg_id: u64, header: &[u8], body: &[u8]) -> Result<Bytes, ProtocolError> {
    assemble(msg_id, header, body)
}

/// Assembles a response frame from already-encoded sections.
pub fn assemble_response(msg_id: u64, header: &[u8], body: &[u8]) -> Result<Bytes, ProtocolError> {
    assemble(msg_id, header, body)
}

fn assemble(msg_id: u64, header: &[u8], body: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut writer = FrameWriter::new(msg_id);
    writer.write_header(|buf| buf.put_slice(header));
    writer.write_body(|buf| {
        buf.put_slice(body);
        Ok(())
    })?;
    writer.finish()
}

/// Splits one complete frame into message id, header and body.
pub fn split_frame(raw: &[u8]) -> Result<Frame, ProtocolError> {
    let mut buf = BytesMut::from(raw);
    match Frame::decode(&mut buf)? {
        Some(frame) if buf.is_empty() => Ok(frame),
        Some(_) => Err(ProtocolError::malformed(format!(
            "{} trailing bytes after frame",
            buf.len()
        ))),
        None => Err(ProtocolError::TruncatedFrame {
            needed: bytes_needed(raw),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn test_assemble_split_roundtrip() {
        let raw = assemble_request(42, b"header", b"body").unwrap();
        assert_eq!(raw.len(), FRAME_PREFIX_SIZE + 10);

        let frame = split_frame(&raw).unwrap();
        assert_eq!(frame.msg_id, 42);
        assert_eq!(frame.header.as_ref(), b"header");
        assert_eq!(frame.body.as_ref(), b"body");
    }

    #[test]
    fn test_empty_sections() {
        let raw = assemble_response(u64::MAX, b"", b"").unwrap();
        let frame = split_frame(&raw).unwrap();
        assert_eq!(frame, Frame::new(u64::MAX, Bytes::new(), Bytes::new()));
    }

    #[test]
    fn test_truncated_frame() {
        let raw = assemble_request(1, b"hdr", b"payload").unwrap();

        let err = split_frame(&raw[..raw.len() - 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedFrame { needed: 3 }));
        assert_eq!(err.kind(), ErrorKind::TruncatedFrame);

        let err = split_frame(&raw[..8]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TruncatedFrame { needed } if needed == FRAME_PREFIX_SIZE - 8
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut raw = BytesMut::from(&assemble_request(1, b"h", b"b").unwrap()[..]);
        raw.put_u8(0);
        assert!(matches!(
            split_frame(&raw),
            Err(ProtocolError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let mut raw = BytesMut::from(&assemble_request(1, b"h", b"b").unwrap()[..]);
        raw[0] = b'X';
        assert!(matches!(
            split_frame(&raw),
            Err(ProtocolError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_header_len_exceeds_total() {
        let mut raw = BytesMut::from(&assemble_request(1, b"h", b"b").unwrap()[..]);
        raw[HEADER_LEN_OFFSET..FRAME_PREFIX_SIZE].copy_from_slice(&99u32.to_be_bytes());
        let err = split_frame(&raw).unwrap_err();
        assert!(err.kind().is_connection_fatal());
    }

    #[test]
    fn test_frame_too_large() {
        let mut raw = BytesMut::from(&assemble_request(1, b"h", b"b").unwrap()[..]);
        raw[TOTAL_LEN_OFFSET..HEADER_LEN_OFFSET]
            .copy_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        assert!(matches!(
            Frame::decode(&mut raw),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_limit_applies_to_declared_length() {
        let raw = assemble_request(1, b"h", &[0u8; 100]).unwrap();
        // Only the prefix has arrived; its declared length already exceeds the limit.
        let mut buf = BytesMut::from(&raw[..FRAME_PREFIX_SIZE]);
        let err = Frame::decode_with_limit(&mut buf, 64).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge { size: 101, max: 64 }
        ));

        let mut buf = BytesMut::from(&raw[..]);
        assert!(Frame::decode_with_limit(&mut buf, 101).unwrap().is_some());
    }

    #[test]
    fn test_streaming_decode_partial_then_complete() {
        let raw = assemble_request(7, b"abc", b"defg").unwrap();
        let mut buf = BytesMut::from(&raw[..10]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(&raw[10..]);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.msg_id, 7);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&assemble_request(1, b"h1", b"b1").unwrap());
        buf.extend_from_slice(&assemble_response(2, b"h2", b"b2").unwrap());

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.msg_id, 1);
        assert_eq!(second.msg_id, 2);
        assert_eq!(second.body.as_ref(), b"b2");
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_failed_body_leaves_no_partial_bytes() {
        let mut writer = FrameWriter::new(5);
        writer.write_header(|buf| buf.put_slice(b"header"));
        let err = writer
            .write_body(|buf| {
                buf.put_slice(b"partial");
                Err(ProtocolError::serialization("boom"))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SerializationFailure);

        writer
            .write_body(|buf| {
                buf.put_slice(b"body");
                Ok(())
            })
            .unwrap();
        let frame = split_frame(&writer.finish().unwrap()).unwrap();
        assert_eq!(frame.header.as_ref(), b"header");
        assert_eq!(frame.body.as_ref(), b"body");
    }

    #[test]
    fn test_frame_encode_matches_assemble() {
        let frame = Frame::new(9, Bytes::from_static(b"h"), Bytes::from_static(b"b"));
        assert_eq!(
            frame.encode().unwrap(),
            assemble_request(9, b"h", b"b").unwrap()
        );
    }

    proptest! {
        #[test]
        fn prop_assemble_split_roundtrip(
            msg_id in any::<u64>(),
            header in proptest::collection::vec(any::<u8>(), 0..256),
            body in proptest::collection::vec(any::<u8>(), 0..1024),
        ) {
            let raw = assemble_request(msg_id, &header, &body).unwrap();
            let frame = split_frame(&raw).unwrap();
            prop_assert_eq!(frame.msg_id, msg_id);
            prop_assert_eq!(frame.header.as_ref(), &header[..]);
            prop_assert_eq!(frame.body.as_ref(), &body[..]);
        }
    }
}
