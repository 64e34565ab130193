//! AWS binary event-stream framing
//!
//! Each frame is a 12-byte prelude (total length, headers length, prelude
//! CRC32), a typed header block, the payload and a trailing CRC32 over
//! everything before it. All integers are big-endian.

mod decoder;
mod frame;

pub use decoder::EventStreamDecoder;
pub use frame::{
    ERROR_CODE, EVENT_TYPE, EXCEPTION_TYPE, Frame, HeaderValue, MESSAGE_TYPE, encode_frame, event_frame, exception_frame,
};

/// Bytes of total length, headers length and prelude checksum
pub(crate) const PRELUDE_LEN: usize = 12;

/// Trailing message checksum
pub(crate) const CHECKSUM_LEN: usize = 4;

/// Smallest legal frame: prelude plus trailing checksum
pub(crate) const MIN_FRAME_LEN: usize = PRELUDE_LEN + CHECKSUM_LEN;

/// Largest frame accepted before the stream is considered corrupt
pub(crate) const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Framing violations; every one of them is fatal to the stream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("prelude checksum mismatch (expected {expected:#010x}, computed {computed:#010x})")]
    PreludeChecksum { expected: u32, computed: u32 },

    #[error("message checksum mismatch (expected {expected:#010x}, computed {computed:#010x})")]
    MessageChecksum { expected: u32, computed: u32 },

    #[error("invalid frame length {total} with {headers} header bytes")]
    InvalidLength { total: usize, headers: usize },

    #[error("malformed header block: {0}")]
    MalformedHeader(String),

    #[error("malformed {event_type} payload: {message}")]
    MalformedPayload { event_type: String, message: String },

    #[error("unknown header value type {0}")]
    UnknownHeaderType(u8),

    #[error("stream ended inside a frame ({0} bytes buffered)")]
    Truncated(usize),

    #[error("decoder stopped after an earlier error")]
    Poisoned,
}
