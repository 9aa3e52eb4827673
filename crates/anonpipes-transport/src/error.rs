/// Errors that can occur in pipe transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The OS refused to allocate a pipe.
    #[error("failed to create pipe: {0}")]
    Create(std::io::Error),

    /// A handle string could not be turned into an open pipe end.
    #[error("invalid pipe handle '{handle}': {reason}")]
    InvalidHandle { handle: String, reason: String },

    /// An I/O error occurred on the pipe.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
