use std::time::Duration;

use anonpipes_frame::FrameError;
use anonpipes_transport::TransportError;

/// Errors that can occur in endpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// Transport-level error while creating or opening pipes.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or truncated frame on the wire.
    #[error("frame error: {0}")]
    Frame(FrameError),

    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed in the endpoint's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The endpoint has been disposed.
    #[error("endpoint has been disposed")]
    Disposed,

    /// The client did not connect in time.
    #[error("pipe client failed to connect within the specified amount of time")]
    Timeout(Duration),

    /// I/O error on the pipes, including use of a broken or disconnected endpoint.
    #[error("pipe I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The first control byte from the client was not CONNECT.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The receive callback returned an error.
    #[error("receive callback failed: {0}")]
    Callback(Box<dyn std::error::Error + Send + Sync>),

    /// The receive callback panicked.
    #[error("receive callback panicked: {0}")]
    CallbackPanicked(String),
}

impl From<FrameError> for EndpointError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io) => EndpointError::Io(io),
            FrameError::SourceExhausted { .. } => EndpointError::InvalidArgument(err.to_string()),
            other => EndpointError::Frame(other),
        }
    }
}

impl EndpointError {
    pub(crate) fn broken_pipe() -> Self {
        EndpointError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipes are broken",
        ))
    }
}

pub type Result<T> = std::result::Result<T, EndpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_is_fixed() {
        let err = EndpointError::Timeout(Duration::from_millis(10));
        assert_eq!(
            err.to_string(),
            "pipe client failed to connect within the specified amount of time"
        );
    }

    #[test]
    fn frame_io_errors_surface_as_io() {
        let err: EndpointError =
            FrameError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).into();
        assert!(matches!(err, EndpointError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn short_stream_source_is_invalid_argument() {
        let err: EndpointError = FrameError::SourceExhausted {
            expected: 10,
            copied: 4,
        }
        .into();
        assert!(matches!(err, EndpointError::InvalidArgument(msg) if msg.contains("4 of 10")));
    }

    #[test]
    fn protocol_errors_stay_frame_errors() {
        let err: EndpointError = FrameError::UnknownControlByte(9).into();
        assert!(matches!(err, EndpointError::Frame(FrameError::UnknownControlByte(9))));
    }
}
