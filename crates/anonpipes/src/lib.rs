//! Duplex messaging between a parent process and its child over anonymous pipes.
//!
//! # Crate Structure
//!
//! - [`transport`]: Anonymous OS pipes and inheritable handle export
//! - [`frame`]: Control-byte framing and bounded per-message streams
//! - [`endpoint`]: Client and server endpoints, handshake, send/receive engine
//!
//! The most common types are re-exported at the root.

/// Re-export transport types.
pub mod transport {
    pub use anonpipes_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use anonpipes_frame::*;
}

/// Re-export endpoint types.
pub mod endpoint {
    pub use anonpipes_endpoint::*;
}

pub use anonpipes_endpoint::{
    CallbackResult, ClientHandles, ConnectionState, Endpoint, EndpointConfig, EndpointError,
    Message, Notifier, PipeClient, PipeServer, Result, ServerConfig,
};
