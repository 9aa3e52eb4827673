//! Anonymous pipe transport for parent/child IPC.
//!
//! Provides the one-directional byte streams the rest of anonpipes is built on:
//! - [`PipeReader`] / [`PipeWriter`]: blocking ends of an OS pipe
//! - [`InheritableHandle`]: a pipe end prepared for a child process, exported
//!   as an opaque handle string
//!
//! This is the lowest layer of anonpipes. Reads may return fewer bytes than
//! requested and return 0 once every write end is closed.

pub mod error;

#[cfg(unix)]
pub mod pipe;

pub use error::{Result, TransportError};

#[cfg(unix)]
pub use pipe::{anonymous_pipe, inbound_pipe, outbound_pipe, InheritableHandle, PipeReader, PipeWriter};
