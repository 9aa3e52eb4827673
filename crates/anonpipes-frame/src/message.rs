use std::fmt;
use std::io::{ErrorKind, Read};

use bytes::Bytes;

use crate::error::{FrameError, Result};
use crate::reader::read_full;

/// Chunk size used when discarding unread message bytes.
pub const DROP_CHUNK_SIZE: usize = 4 * 1024;

/// Read-only view over exactly one data frame's payload.
///
/// The stream borrows the underlying transport for the lifetime of a single
/// frame. Reads never go past `len()` bytes, and every read returns exactly
/// `min(buf.len(), remaining())` bytes, looping over short reads of the
/// transport. Any bytes the consumer leaves unread must be discarded with
/// [`read_to_end_drop_bytes`](Self::read_to_end_drop_bytes) before the next
/// frame header can be read.
pub struct MessageStream<'a, R: Read + ?Sized> {
    inner: &'a mut R,
    length: u64,
    position: u64,
}

impl<'a, R: Read + ?Sized> MessageStream<'a, R> {
    /// Wrap `inner`, exposing the next `length` bytes.
    pub fn new(inner: &'a mut R, length: u64) -> Self {
        Self {
            inner,
            length,
            position: 0,
        }
    }

    /// Total payload length of the message.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether the message has no payload at all.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left before the end of the message.
    pub fn remaining(&self) -> u64 {
        self.length - self.position
    }

    /// Read up to `buf.len()` bytes of the message.
    ///
    /// Returns `Ok(0)` only for an empty `buf`. Fails with
    /// [`FrameError::EndOfStream`] once the message is exhausted and with
    /// [`FrameError::ConnectionClosed`] if the transport ends mid-frame.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let remaining = self.remaining();
        if remaining == 0 {
            return Err(FrameError::EndOfStream);
        }

        let count = remaining.min(buf.len() as u64) as usize;
        read_full(&mut *self.inner, &mut buf[..count])?;
        self.position += count as u64;
        Ok(count)
    }

    /// Read everything that is left into one buffer.
    pub fn read_to_end(&mut self) -> Result<Bytes> {
        let remaining = self.remaining();
        if remaining > isize::MAX as u64 {
            return Err(FrameError::MessageTooLarge {
                length: remaining,
                max: isize::MAX as u64,
            });
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(remaining as usize)
            .map_err(|_| FrameError::MessageTooLarge {
                length: remaining,
                max: isize::MAX as u64,
            })?;

        // Only bytes that actually arrive are written to the buffer.
        let copied = loop {
            match (&mut *self.inner).take(remaining).read_to_end(&mut buf) {
                Ok(copied) => break copied as u64,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        };
        self.position += copied;
        if copied < remaining {
            return Err(FrameError::ConnectionClosed);
        }
        Ok(Bytes::from(buf))
    }

    /// Discard everything that is left, leaving the transport positioned at
    /// the next frame header.
    pub fn read_to_end_drop_bytes(&mut self) -> Result<()> {
        let mut scratch = [0u8; DROP_CHUNK_SIZE];
        while self.remaining() > 0 {
            let count = self.remaining().min(DROP_CHUNK_SIZE as u64) as usize;
            read_full(&mut *self.inner, &mut scratch[..count])?;
            self.position += count as u64;
        }
        Ok(())
    }
}

impl<R: Read + ?Sized> Read for MessageStream<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining() == 0 {
            return Ok(0);
        }
        MessageStream::read(self, buf).map_err(|err| match err {
            FrameError::Io(io) if io.kind() == ErrorKind::Interrupted => io,
            other => other.into(),
        })
    }
}

impl<R: Read + ?Sized> fmt::Debug for MessageStream<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStream")
            .field("length", &self.length)
            .field("position", &self.position)
            .finish()
    }
}
