use bytes::{BufMut, Bytes, BytesMut};

use super::{CHECKSUM_LEN, PRELUDE_LEN};

/// Header names the upstream uses to classify frames
pub const MESSAGE_TYPE: &str = ":message-type";
pub const EVENT_TYPE: &str = ":event-type";
pub const EXCEPTION_TYPE: &str = ":exception-type";
pub const ERROR_CODE: &str = ":error-code";

/// Typed header value, tagged on the wire by a single byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    ByteArray(Bytes),
    String(String),
    /// Milliseconds since the Unix epoch
    Timestamp(i64),
    Uuid([u8; 16]),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) const fn type_tag(&self) -> u8 {
        match self {
            Self::Bool(true) => 0,
            Self::Bool(false) => 1,
            Self::Byte(_) => 2,
            Self::Int16(_) => 3,
            Self::Int32(_) => 4,
            Self::Int64(_) => 5,
            Self::ByteArray(_) => 6,
            Self::String(_) => 7,
            Self::Timestamp(_) => 8,
            Self::Uuid(_) => 9,
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.type_tag());
        match self {
            Self::Bool(_) => {}
            Self::Byte(v) => out.put_i8(*v),
            Self::Int16(v) => out.put_i16(*v),
            Self::Int32(v) => out.put_i32(*v),
            Self::Int64(v) | Self::Timestamp(v) => out.put_i64(*v),
            Self::ByteArray(v) => {
                out.put_u16(u16::try_from(v.len()).unwrap_or(u16::MAX));
                out.put_slice(&v[..v.len().min(usize::from(u16::MAX))]);
            }
            Self::String(v) => {
                out.put_u16(u16::try_from(v.len()).unwrap_or(u16::MAX));
                out.put_slice(&v.as_bytes()[..v.len().min(usize::from(u16::MAX))]);
            }
            Self::Uuid(v) => out.put_slice(v),
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Bytes,
}

impl Frame {
    /// First header with the given name
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(HeaderValue::as_str)
    }

    /// `:message-type`, `event` when absent
    pub fn message_type(&self) -> &str {
        self.header_str(MESSAGE_TYPE).unwrap_or("event")
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header_str(EVENT_TYPE)
    }
}

/// Encode a frame, computing both checksums
///
/// Used by the mock upstream in tests and by anything that needs to
/// replay captured traffic.
pub fn encode_frame(headers: &[(&str, HeaderValue)], payload: &[u8]) -> Bytes {
    let mut header_block = BytesMut::new();
    for (name, value) in headers {
        let name = &name.as_bytes()[..name.len().min(usize::from(u8::MAX))];
        header_block.put_u8(u8::try_from(name.len()).unwrap_or(u8::MAX));
        header_block.put_slice(name);
        value.encode(&mut header_block);
    }

    let total = PRELUDE_LEN + header_block.len() + payload.len() + CHECKSUM_LEN;
    let mut out = BytesMut::with_capacity(total);
    out.put_u32(u32::try_from(total).unwrap_or(u32::MAX));
    out.put_u32(u32::try_from(header_block.len()).unwrap_or(u32::MAX));
    let prelude_crc = crc32fast::hash(&out[..8]);
    out.put_u32(prelude_crc);
    out.put_slice(&header_block);
    out.put_slice(payload);
    let message_crc = crc32fast::hash(&out);
    out.put_u32(message_crc);

    out.freeze()
}

/// Convenience for the common event frame shape
pub fn event_frame(event_type: &str, payload: &[u8]) -> Bytes {
    encode_frame(
        &[
            (MESSAGE_TYPE, HeaderValue::String("event".to_owned())),
            (EVENT_TYPE, HeaderValue::String(event_type.to_owned())),
            (":content-type", HeaderValue::String("application/json".to_owned())),
        ],
        payload,
    )
}

/// Convenience for an exception frame
pub fn exception_frame(exception_type: &str, payload: &[u8]) -> Bytes {
    encode_frame(
        &[
            (MESSAGE_TYPE, HeaderValue::String("exception".to_owned())),
            (EXCEPTION_TYPE, HeaderValue::String(exception_type.to_owned())),
        ],
        payload,
    )
}
