//! Incremental decoder for the AWS `application/vnd.amazon.eventstream`
//! binary framing used by Bedrock streaming responses.
//!
//! Frame layout: 4-byte total length, 4-byte header-block length, 4-byte
//! prelude CRC32, header block, payload, 4-byte message CRC32. All integers
//! are big-endian.

use bytes::{Buf, Bytes, BytesMut};

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    ByteArray(Bytes),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Bytes,
}

impl Frame {
    fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header(":message-type")?.as_str()
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(":event-type")?.as_str()
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.header(":exception-type")?.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    PreludeChecksum,
    MessageChecksum,
    FrameTooLarge(usize),
    MalformedHeaders,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::PreludeChecksum => write!(f, "event-stream prelude checksum mismatch"),
            DecodeError::MessageChecksum => write!(f, "event-stream message checksum mismatch"),
            DecodeError::FrameTooLarge(len) => write!(f, "event-stream frame too large: {len}"),
            DecodeError::MalformedHeaders => write!(f, "event-stream header block malformed"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every complete frame now available.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, DecodeError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.try_decode_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_decode_one(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total_len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if total_len > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLarge(total_len));
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let headers_len = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;
        let prelude_crc = u32::from_be_bytes([
            self.buffer[8],
            self.buffer[9],
            self.buffer[10],
            self.buffer[11],
        ]);
        if crc32fast::hash(&self.buffer[..8]) != prelude_crc {
            return Err(DecodeError::PreludeChecksum);
        }
        if total_len < PRELUDE_LEN + headers_len + CRC_LEN {
            return Err(DecodeError::MalformedHeaders);
        }

        let message_crc = u32::from_be_bytes([
            self.buffer[total_len - 4],
            self.buffer[total_len - 3],
            self.buffer[total_len - 2],
            self.buffer[total_len - 1],
        ]);
        if crc32fast::hash(&self.buffer[..total_len - CRC_LEN]) != message_crc {
            return Err(DecodeError::MessageChecksum);
        }

        let mut frame = self.buffer.split_to(total_len).freeze();
        frame.advance(PRELUDE_LEN);
        let header_block = frame.split_to(headers_len);
        let payload = frame.split_to(frame.len() - CRC_LEN);

        let headers = decode_headers(header_block)?;
        Ok(Some(Frame { headers, payload }))
    }
}

fn decode_headers(mut block: Bytes) -> Result<Vec<(String, HeaderValue)>, DecodeError> {
    let mut headers = Vec::new();
    while block.has_remaining() {
        if block.remaining() < 2 {
            return Err(DecodeError::MalformedHeaders);
        }
        let name_len = block.get_u8() as usize;
        if block.remaining() < name_len + 1 {
            return Err(DecodeError::MalformedHeaders);
        }
        let name_bytes = block.split_to(name_len);
        let name = std::str::from_utf8(&name_bytes)
            .map_err(|_| DecodeError::MalformedHeaders)?
            .to_string();

        let value_type = block.get_u8();
        let value = match value_type {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => {
                ensure_remaining(&block, 1)?;
                HeaderValue::Byte(block.get_i8())
            }
            3 => {
                ensure_remaining(&block, 2)?;
                HeaderValue::Int16(block.get_i16())
            }
            4 => {
                ensure_remaining(&block, 4)?;
                HeaderValue::Int32(block.get_i32())
            }
            5 => {
                ensure_remaining(&block, 8)?;
                HeaderValue::Int64(block.get_i64())
            }
            6 => {
                ensure_remaining(&block, 2)?;
                let len = block.get_u16() as usize;
                ensure_remaining(&block, len)?;
                HeaderValue::ByteArray(block.split_to(len))
            }
            7 => {
                ensure_remaining(&block, 2)?;
                let len = block.get_u16() as usize;
                ensure_remaining(&block, len)?;
                let bytes = block.split_to(len);
                HeaderValue::String(
                    std::str::from_utf8(&bytes)
                        .map_err(|_| DecodeError::MalformedHeaders)?
                        .to_string(),
                )
            }
            8 => {
                ensure_remaining(&block, 8)?;
                HeaderValue::Timestamp(block.get_i64())
            }
            9 => {
                ensure_remaining(&block, 16)?;
                let mut uuid = [0u8; 16];
                block.copy_to_slice(&mut uuid);
                HeaderValue::Uuid(uuid)
            }
            _ => return Err(DecodeError::MalformedHeaders),
        };
        headers.push((name, value));
    }
    Ok(headers)
}

fn ensure_remaining(block: &Bytes, needed: usize) -> Result<(), DecodeError> {
    if block.remaining() < needed {
        return Err(DecodeError::MalformedHeaders);
    }
    Ok(())
}

/// Encode one frame (tests and stubbed upstreams).
pub fn encode_frame(headers: &[(String, HeaderValue)], payload: &[u8]) -> Vec<u8> {
    let mut header_block = Vec::new();
    for (name, value) in headers {
        header_block.push(name.len() as u8);
        header_block.extend_from_slice(name.as_bytes());
        match value {
            HeaderValue::Bool(true) => header_block.push(0),
            HeaderValue::Bool(false) => header_block.push(1),
            HeaderValue::Byte(v) => {
                header_block.push(2);
                header_block.push(*v as u8);
            }
            HeaderValue::Int16(v) => {
                header_block.push(3);
                header_block.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Int32(v) => {
                header_block.push(4);
                header_block.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Int64(v) => {
                header_block.push(5);
                header_block.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::ByteArray(v) => {
                header_block.push(6);
                header_block.extend_from_slice(&(v.len() as u16).to_be_bytes());
                header_block.extend_from_slice(v);
            }
            HeaderValue::String(v) => {
                header_block.push(7);
                header_block.extend_from_slice(&(v.len() as u16).to_be_bytes());
                header_block.extend_from_slice(v.as_bytes());
            }
            HeaderValue::Timestamp(v) => {
                header_block.push(8);
                header_block.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Uuid(v) => {
                header_block.push(9);
                header_block.extend_from_slice(v);
            }
        }
    }

    let total_len = PRELUDE_LEN + header_block.len() + payload.len() + CRC_LEN;
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(total_len as u32).to_be_bytes());
    out.extend_from_slice(&(header_block.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&out[..8]);
    out.extend_from_slice(&prelude_crc.to_be_bytes());
    out.extend_from_slice(&header_block);
    out.extend_from_slice(payload);
    let message_crc = crc32fast::hash(&out);
    out.extend_from_slice(&message_crc.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_headers(event_type: &str) -> Vec<(String, HeaderValue)> {
        vec![
            (
                ":message-type".to_string(),
                HeaderValue::String("event".to_string()),
            ),
            (
                ":event-type".to_string(),
                HeaderValue::String(event_type.to_string()),
            ),
        ]
    }

    #[test]
    fn encode_decode_round_trip() {
        let payload = br#"{"bytes":"eyJrIjoidiJ9"}"#;
        let wire = encode_frame(&event_headers("chunk"), payload);

        let mut decoder = EventStreamDecoder::new();
        let frames = decoder.push_bytes(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), Some("chunk"));
        assert_eq!(frames[0].message_type(), Some("event"));
        assert_eq!(&frames[0].payload[..], payload);
    }

    #[test]
    fn frames_reassemble_across_chunk_boundaries() {
        let wire = encode_frame(&event_headers("chunk"), b"{}");
        let mut decoder = EventStreamDecoder::new();
        let (head, tail) = wire.split_at(7);
        assert!(decoder.push_bytes(head).unwrap().is_empty());
        let frames = decoder.push_bytes(tail).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn corrupted_prelude_is_rejected() {
        let mut wire = encode_frame(&event_headers("chunk"), b"{}");
        wire[4] ^= 0xff;
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.push_bytes(&wire).is_err());
    }

    #[test]
    fn exception_frames_expose_their_type() {
        let headers = vec![
            (
                ":message-type".to_string(),
                HeaderValue::String("exception".to_string()),
            ),
            (
                ":exception-type".to_string(),
                HeaderValue::String("throttlingException".to_string()),
            ),
        ];
        let wire = encode_frame(&headers, b"{\"message\":\"slow down\"}");
        let mut decoder = EventStreamDecoder::new();
        let frames = decoder.push_bytes(&wire).unwrap();
        assert_eq!(frames[0].exception_type(), Some("throttlingException"));
    }
}
