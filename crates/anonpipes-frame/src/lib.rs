//! Control-byte framing for anonymous pipe IPC.
//!
//! Every frame starts with one control byte:
//! - `CONNECT` (1) and `DISCONNECT` (2) are bare markers
//! - `DATA` (3) is followed by an 8-byte little-endian length and the payload
//!
//! Payloads are never buffered by the reader: each data frame is exposed as a
//! [`MessageStream`] bounded to exactly its length.

pub mod codec;
pub mod control;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_header, decode_length, encode_data_frame, encode_header, Frame, FrameConfig,
    DATA_HEADER_SIZE, DEFAULT_STREAM_CHUNK, LENGTH_SIZE,
};
pub use control::{control_name, ControlByte, CONNECT, DATA, DISCONNECT};
pub use error::{FrameError, Result};
pub use message::{MessageStream, DROP_CHUNK_SIZE};
pub use reader::FrameReader;
pub use writer::FrameWriter;
