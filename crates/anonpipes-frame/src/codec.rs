use bytes::{Buf, BufMut, BytesMut};

use crate::control::{ControlByte, CONNECT, DATA, DISCONNECT};
use crate::error::{FrameError, Result};

/// Size of the length field that follows a DATA control byte.
pub const LENGTH_SIZE: usize = 8;

/// Data frame header: control byte (1) + length (8) = 9 bytes.
pub const DATA_HEADER_SIZE: usize = 1 + LENGTH_SIZE;

/// Default chunk size used when streaming payloads from a reader: 64 KiB.
pub const DEFAULT_STREAM_CHUNK: usize = 64 * 1024;

/// One protocol unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Handshake marker, no payload.
    Connect,
    /// Shutdown marker, no payload.
    Disconnect,
    /// Data packet header; `length` payload bytes follow on the wire.
    Data { length: u64 },
}

impl Frame {
    /// The control byte this frame starts with.
    pub fn control(&self) -> ControlByte {
        match self {
            Frame::Connect => ControlByte::Connect,
            Frame::Disconnect => ControlByte::Disconnect,
            Frame::Data { .. } => ControlByte::Data,
        }
    }

    /// Number of header bytes on the wire.
    pub fn header_size(&self) -> usize {
        match self {
            Frame::Data { .. } => DATA_HEADER_SIZE,
            _ => 1,
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> u64 {
        match self {
            Frame::Data { length } => DATA_HEADER_SIZE as u64 + length,
            _ => 1,
        }
    }
}

/// Encode a frame header into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┐
/// │ 0x01 CONNECT │
/// └──────────────┘
/// ┌─────────────────┐
/// │ 0x02 DISCONNECT │
/// └─────────────────┘
/// ┌───────────┬──────────────┬──────────────────┐
/// │ 0x03 DATA │ Length       │ Payload          │
/// │           │ (8B LE, u64) │ (Length bytes)   │
/// └───────────┴──────────────┴──────────────────┘
/// ```
pub fn encode_header(frame: &Frame, dst: &mut BytesMut) {
    dst.reserve(frame.header_size());
    dst.put_u8(frame.control().as_u8());
    if let Frame::Data { length } = frame {
        dst.put_u64_le(*length);
    }
}

/// Encode a complete data frame (header + payload).
pub fn encode_data_frame(payload: &[u8], dst: &mut BytesMut) {
    let frame = Frame::Data {
        length: payload.len() as u64,
    };
    dst.reserve(frame.header_size() + payload.len());
    encode_header(&frame, dst);
    dst.put_slice(payload);
}

/// Decode the length field of a data frame.
pub fn decode_length(bytes: [u8; LENGTH_SIZE]) -> u64 {
    u64::from_le_bytes(bytes)
}

/// Decode a frame header from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete header yet.
/// On success, consumes the header bytes; a data frame's payload is left in
/// the buffer for the caller.
pub fn decode_header(src: &mut BytesMut) -> Result<Option<Frame>> {
    let Some(&control) = src.first() else {
        return Ok(None);
    };

    let frame = match control {
        CONNECT => Frame::Connect,
        DISCONNECT => Frame::Disconnect,
        DATA => {
            if src.len() < DATA_HEADER_SIZE {
                return Ok(None); // Need more data
            }
            let mut length = [0u8; LENGTH_SIZE];
            length.copy_from_slice(&src[1..DATA_HEADER_SIZE]);
            Frame::Data {
                length: decode_length(length),
            }
        }
        other => return Err(FrameError::UnknownControlByte(other)),
    };

    src.advance(frame.header_size());
    Ok(Some(frame))
}

/// Configuration for frame writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Chunk size for copying streamed payloads. Default: 64 KiB.
    pub stream_chunk_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            stream_chunk_size: DEFAULT_STREAM_CHUNK,
        }
    }
}
