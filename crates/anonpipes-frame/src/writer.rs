use std::io::{ErrorKind, Read, Write};

use bytes::BytesMut;
use tracing::trace;

use crate::codec::{encode_header, Frame, FrameConfig, DATA_HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Writes complete frames to any `Write` stream.
///
/// Headers are encoded into a small reusable buffer; payloads are written
/// straight from the caller's slice or copied in chunks from a reader.
pub struct FrameWriter<T> {
    inner: T,
    header: BytesMut,
    chunk: Vec<u8>,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            header: BytesMut::with_capacity(DATA_HEADER_SIZE),
            chunk: Vec::new(),
            config,
        }
    }

    /// Write a CONNECT marker and flush.
    pub fn send_connect(&mut self) -> Result<()> {
        self.write_header(&Frame::Connect)?;
        self.flush()
    }

    /// Write a DISCONNECT marker and flush.
    pub fn send_disconnect(&mut self) -> Result<()> {
        self.write_header(&Frame::Disconnect)?;
        self.flush()
    }

    /// Write a complete data frame carrying `payload` and flush.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.write_header(&Frame::Data {
            length: payload.len() as u64,
        })?;
        self.write_all(payload)?;
        self.flush()
    }

    /// Write a data frame of exactly `length` bytes copied from `source`.
    ///
    /// The header goes out before the source is read. If the source ends
    /// early the frame on the wire is truncated and the stream can no longer
    /// be used; the error is [`FrameError::SourceExhausted`].
    pub fn send_from<R: Read + ?Sized>(&mut self, source: &mut R, length: u64) -> Result<()> {
        self.write_header(&Frame::Data { length })?;

        let chunk_size = self.config.stream_chunk_size.max(1);
        let mut chunk = std::mem::take(&mut self.chunk);
        chunk.resize(chunk_size, 0);

        let result = self.copy_from(source, length, &mut chunk);
        self.chunk = chunk;
        result?;

        self.flush()
    }

    fn copy_from<R: Read + ?Sized>(
        &mut self,
        source: &mut R,
        length: u64,
        chunk: &mut [u8],
    ) -> Result<()> {
        let mut copied = 0u64;
        while copied < length {
            let want = (length - copied).min(chunk.len() as u64) as usize;
            let n = match source.read(&mut chunk[..want]) {
                Ok(0) => {
                    return Err(FrameError::SourceExhausted {
                        expected: length,
                        copied,
                    })
                }
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };
            self.write_all(&chunk[..n])?;
            copied += n as u64;
        }
        Ok(())
    }

    fn write_header(&mut self, frame: &Frame) -> Result<()> {
        self.header.clear();
        encode_header(frame, &mut self.header);
        trace!(?frame, "write frame header");

        let header = std::mem::take(&mut self.header);
        let result = self.write_all(&header);
        self.header = header;
        result
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.inner.write(buf) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => buf = &buf[n..],
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(())
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
