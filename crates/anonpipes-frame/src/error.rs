/// Errors that can occur while encoding, decoding or reading frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed in the middle of a frame.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// A read was attempted past the end of a message.
    #[error("read past the end of the message")]
    EndOfStream,

    /// The message cannot be held in a single in-memory buffer.
    #[error("message too large to buffer ({length} bytes, max {max})")]
    MessageTooLarge { length: u64, max: u64 },

    /// The stream contained a byte that is not a known control byte.
    #[error("unknown control byte 0x{0:02x}")]
    UnknownControlByte(u8),

    /// A streamed payload source ended before the announced length.
    #[error("payload source ended after {copied} of {expected} bytes")]
    SourceExhausted { expected: u64, copied: u64 },
}

pub type Result<T> = std::result::Result<T, FrameError>;

impl From<FrameError> for std::io::Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io) => io,
            FrameError::ConnectionClosed | FrameError::EndOfStream => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err)
            }
            other => std::io::Error::other(other),
        }
    }
}
