use std::io::{ErrorKind, Read};

use tracing::trace;

use crate::codec::{decode_length, Frame, LENGTH_SIZE};
use crate::control::ControlByte;
use crate::error::{FrameError, Result};
use crate::message::MessageStream;

/// Reads frame headers from any `Read` stream.
///
/// Handles short reads internally. Payloads are not buffered: after a
/// [`Frame::Data`] header, [`message`](Self::message) hands out a bounded view
/// over the next `length` bytes of the stream.
pub struct FrameReader<T> {
    inner: T,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader.
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Read one raw control byte (blocking).
    ///
    /// Returns `Ok(None)` when the stream is at EOF.
    pub fn read_control(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Read the next frame header (blocking).
    ///
    /// Returns `Ok(None)` on a clean EOF between frames and
    /// `Err(FrameError::ConnectionClosed)` if EOF hits inside a header.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some(byte) = self.read_control()? else {
            return Ok(None);
        };

        let frame = match ControlByte::try_from(byte)? {
            ControlByte::Connect => Frame::Connect,
            ControlByte::Disconnect => Frame::Disconnect,
            ControlByte::Data => Frame::Data {
                length: self.read_length()?,
            },
        };
        trace!(?frame, "read frame header");
        Ok(Some(frame))
    }

    /// Read the 8-byte length that follows a `DATA` control byte.
    ///
    /// For callers that consume the control byte themselves with
    /// [`read_control`](Self::read_control).
    pub fn read_length(&mut self) -> Result<u64> {
        let mut length = [0u8; LENGTH_SIZE];
        read_full(&mut self.inner, &mut length)?;
        Ok(decode_length(length))
    }

    /// Bounded view over the payload of a data frame of `length` bytes.
    pub fn message(&mut self, length: u64) -> MessageStream<'_, T> {
        MessageStream::new(&mut self.inner, length)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

/// Fill `buf` completely, looping over short reads.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(())
}
