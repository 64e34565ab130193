use std::mem;

use bytes::{Buf, Bytes, BytesMut};
use crc32fast::Hasher;

use super::frame::{Frame, HeaderValue};
use super::{CHECKSUM_LEN, MAX_FRAME_LEN, MIN_FRAME_LEN, PRELUDE_LEN, ProtocolError};

enum State {
    AwaitingPrelude,
    AwaitingHeaders {
        headers_len: usize,
        payload_len: usize,
    },
    AwaitingPayload {
        headers: Vec<(String, HeaderValue)>,
        payload_len: usize,
    },
    AwaitingTrailingChecksum {
        headers: Vec<(String, HeaderValue)>,
        payload: Bytes,
    },
    Failed,
}

/// Incremental decoder for one upstream connection
///
/// Bytes are pushed with [`feed`](Self::feed) in chunks of any size and
/// complete frames are pulled with [`next_frame`](Self::next_frame). A frame
/// is only produced once its trailing checksum verified. The first framing
/// error poisons the decoder.
pub struct EventStreamDecoder {
    buffer: BytesMut,
    state: State,
    crc: Hasher,
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: State::AwaitingPrelude,
            crc: Hasher::new(),
        }
    }

    /// Append raw bytes received from the upstream
    pub fn feed(&mut self, chunk: &[u8]) {
        if !matches!(self.state, State::Failed) {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// Next complete frame, or `None` if more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            // Any early return below leaves the decoder failed
            match mem::replace(&mut self.state, State::Failed) {
                State::Failed => return Err(ProtocolError::Poisoned),

                State::AwaitingPrelude => {
                    if self.buffer.len() < PRELUDE_LEN {
                        self.state = State::AwaitingPrelude;
                        return Ok(None);
                    }

                    let prelude = self.buffer.split_to(PRELUDE_LEN);
                    let mut fields = &prelude[..];
                    let total = fields.get_u32() as usize;
                    let headers_len = fields.get_u32() as usize;
                    let expected = fields.get_u32();

                    let computed = crc32fast::hash(&prelude[..8]);
                    if computed != expected {
                        return Err(ProtocolError::PreludeChecksum { expected, computed });
                    }

                    if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total) || headers_len > total - MIN_FRAME_LEN {
                        return Err(ProtocolError::InvalidLength {
                            total,
                            headers: headers_len,
                        });
                    }

                    self.crc = Hasher::new();
                    self.crc.update(&prelude);
                    self.state = State::AwaitingHeaders {
                        headers_len,
                        payload_len: total - MIN_FRAME_LEN - headers_len,
                    };
                }

                State::AwaitingHeaders {
                    headers_len,
                    payload_len,
                } => {
                    if self.buffer.len() < headers_len {
                        self.state = State::AwaitingHeaders {
                            headers_len,
                            payload_len,
                        };
                        return Ok(None);
                    }

                    let block = self.buffer.split_to(headers_len);
                    self.crc.update(&block);
                    let headers = parse_headers(&block)?;
                    self.state = State::AwaitingPayload { headers, payload_len };
                }

                State::AwaitingPayload { headers, payload_len } => {
                    if self.buffer.len() < payload_len {
                        self.state = State::AwaitingPayload { headers, payload_len };
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(payload_len).freeze();
                    self.crc.update(&payload);
                    self.state = State::AwaitingTrailingChecksum { headers, payload };
                }

                State::AwaitingTrailingChecksum { headers, payload } => {
                    if self.buffer.len() < CHECKSUM_LEN {
                        self.state = State::AwaitingTrailingChecksum { headers, payload };
                        return Ok(None);
                    }

                    let expected = self.buffer.get_u32();
                    let computed = mem::take(&mut self.crc).finalize();
                    if computed != expected {
                        return Err(ProtocolError::MessageChecksum { expected, computed });
                    }

                    self.state = State::AwaitingPrelude;
                    return Ok(Some(Frame { headers, payload }));
                }
            }
        }
    }

    /// Drain every complete frame currently buffered
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { decoder: self, done: false }
    }

    /// Check that the stream ended on a frame boundary
    pub fn finish(&self) -> Result<(), ProtocolError> {
        match self.state {
            State::Failed => Err(ProtocolError::Poisoned),
            State::AwaitingPrelude if self.buffer.is_empty() => Ok(()),
            _ => Err(ProtocolError::Truncated(self.buffer.len())),
        }
    }
}

/// Iterator over buffered frames, ending at the first error
pub struct Frames<'a> {
    decoder: &'a mut EventStreamDecoder,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.decoder.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn parse_headers(mut block: &[u8]) -> Result<Vec<(String, HeaderValue)>, ProtocolError> {
    let mut headers = Vec::new();

    while block.has_remaining() {
        let name_len = usize::from(block.get_u8());
        let name = take(&mut block, name_len, "header name")?;
        let name = std::str::from_utf8(name)
            .map_err(|_| ProtocolError::MalformedHeader("header name is not UTF-8".to_owned()))?
            .to_owned();

        if !block.has_remaining() {
            return Err(ProtocolError::MalformedHeader(format!("missing value type for {name}")));
        }

        let value = match block.get_u8() {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => HeaderValue::Byte(i8::from_be_bytes(fixed(&mut block)?)),
            3 => HeaderValue::Int16(i16::from_be_bytes(fixed(&mut block)?)),
            4 => HeaderValue::Int32(i32::from_be_bytes(fixed(&mut block)?)),
            5 => HeaderValue::Int64(i64::from_be_bytes(fixed(&mut block)?)),
            6 => {
                let len = usize::from(u16::from_be_bytes(fixed(&mut block)?));
                HeaderValue::ByteArray(Bytes::copy_from_slice(take(&mut block, len, "byte array")?))
            }
            7 => {
                let len = usize::from(u16::from_be_bytes(fixed(&mut block)?));
                let raw = take(&mut block, len, "string")?;
                let value = std::str::from_utf8(raw)
                    .map_err(|_| ProtocolError::MalformedHeader(format!("value of {name} is not UTF-8")))?;
                HeaderValue::String(value.to_owned())
            }
            8 => HeaderValue::Timestamp(i64::from_be_bytes(fixed(&mut block)?)),
            9 => HeaderValue::Uuid(fixed(&mut block)?),
            other => return Err(ProtocolError::UnknownHeaderType(other)),
        };

        headers.push((name, value));
    }

    Ok(headers)
}

fn take<'a>(block: &mut &'a [u8], len: usize, what: &str) -> Result<&'a [u8], ProtocolError> {
    if block.len() < len {
        return Err(ProtocolError::MalformedHeader(format!(
            "{what} needs {len} bytes, {} left",
            block.len()
        )));
    }

    let (head, rest) = block.split_at(len);
    *block = rest;
    Ok(head)
}

fn fixed<const N: usize>(block: &mut &[u8]) -> Result<[u8; N], ProtocolError> {
    let raw = take(block, N, "fixed-width value")?;
    let mut out = [0; N];
    out.copy_from_slice(raw);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventstream::{encode_frame, event_frame, exception_frame};

    fn sample_stream() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&event_frame("assistantResponseEvent", br#"{"content":"Hello"}"#));
        bytes.extend_from_slice(&encode_frame(
            &[
                (":message-type", HeaderValue::String("event".to_owned())),
                (":event-type", HeaderValue::String("toolUseEvent".to_owned())),
                ("flag", HeaderValue::Bool(true)),
                ("off", HeaderValue::Bool(false)),
                ("byte", HeaderValue::Byte(-3)),
                ("short", HeaderValue::Int16(-300)),
                ("int", HeaderValue::Int32(70_000)),
                ("long", HeaderValue::Int64(-5_000_000_000)),
                ("blob", HeaderValue::ByteArray(Bytes::from_static(&[0, 1, 2]))),
                ("ts", HeaderValue::Timestamp(1_700_000_000_000)),
                ("id", HeaderValue::Uuid([7; 16])),
            ],
            br#"{"name":"get_weather","toolUseId":"t1","input":"{\"a\":"}"#,
        ));
        bytes.extend_from_slice(&event_frame("assistantResponseEvent", b""));
        bytes.extend_from_slice(&exception_frame("ThrottlingException", br#"{"message":"slow down"}"#));
        bytes
    }

    fn decode_all(chunks: &[&[u8]]) -> Result<Vec<Frame>, ProtocolError> {
        let mut decoder = EventStreamDecoder::new();
        let mut frames = Vec::new();

        for chunk in chunks {
            decoder.feed(chunk);
            for frame in decoder.frames() {
                frames.push(frame?);
            }
        }

        decoder.finish()?;
        Ok(frames)
    }

    #[test]
    fn decodes_every_header_type() {
        let bytes = sample_stream();
        let frames = decode_all(&[&bytes]).unwrap();

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].event_type(), Some("assistantResponseEvent"));
        assert_eq!(&frames[0].payload[..], br#"{"content":"Hello"}"#);

        let tool = &frames[1];
        assert_eq!(tool.header("flag"), Some(&HeaderValue::Bool(true)));
        assert_eq!(tool.header("off"), Some(&HeaderValue::Bool(false)));
        assert_eq!(tool.header("byte"), Some(&HeaderValue::Byte(-3)));
        assert_eq!(tool.header("short"), Some(&HeaderValue::Int16(-300)));
        assert_eq!(tool.header("int"), Some(&HeaderValue::Int32(70_000)));
        assert_eq!(tool.header("long"), Some(&HeaderValue::Int64(-5_000_000_000)));
        assert_eq!(tool.header("blob"), Some(&HeaderValue::ByteArray(Bytes::from_static(&[0, 1, 2]))));
        assert_eq!(tool.header("ts"), Some(&HeaderValue::Timestamp(1_700_000_000_000)));
        assert_eq!(tool.header("id"), Some(&HeaderValue::Uuid([7; 16])));

        assert!(frames[2].payload.is_empty());
        assert_eq!(frames[3].message_type(), "exception");
    }

    #[test]
    fn split_at_every_boundary_yields_same_frames() {
        let bytes = sample_stream();
        let whole = decode_all(&[&bytes]).unwrap();

        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            assert_eq!(decode_all(&[head, tail]).unwrap(), whole, "split at {split}");
        }

        let singles: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_all(&singles).unwrap(), whole);
    }

    #[test]
    fn any_flipped_byte_is_a_protocol_error() {
        let bytes = event_frame("assistantResponseEvent", br#"{"content":"integrity"}"#).to_vec();

        for position in 0..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[position] ^= 0x5a;

            let result = decode_all(&[&corrupted]);
            assert!(result.is_err(), "flip at {position} decoded as {result:?}");
        }
    }

    #[test]
    fn partial_frame_yields_nothing_until_complete() {
        let bytes = event_frame("assistantResponseEvent", br#"{"content":"wait"}"#);
        let mut decoder = EventStreamDecoder::new();

        decoder.feed(&bytes[..bytes.len() - 1]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.finish(), Err(ProtocolError::Truncated(CHECKSUM_LEN - 1)));

        decoder.feed(&bytes[bytes.len() - 1..]);
        assert!(decoder.next_frame().unwrap().is_some());
        assert_eq!(decoder.finish(), Ok(()));
    }

    #[test]
    fn decoder_stays_failed_after_error() {
        let mut bytes = event_frame("assistantResponseEvent", b"{}").to_vec();
        bytes[2] ^= 1;

        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&bytes);
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::PreludeChecksum { .. })
        ));

        decoder.feed(&event_frame("assistantResponseEvent", b"{}"));
        assert_eq!(decoder.next_frame(), Err(ProtocolError::Poisoned));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut prelude = Vec::new();
        prelude.extend_from_slice(&u32::try_from(MAX_FRAME_LEN + 1).unwrap().to_be_bytes());
        prelude.extend_from_slice(&0_u32.to_be_bytes());
        let crc = crc32fast::hash(&prelude);
        prelude.extend_from_slice(&crc.to_be_bytes());

        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&prelude);
        assert!(matches!(decoder.next_frame(), Err(ProtocolError::InvalidLength { .. })));
    }
}
