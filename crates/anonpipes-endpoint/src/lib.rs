//! Duplex messaging between a parent process and the child it spawns.
//!
//! A [`PipeServer`] in the parent creates two anonymous pipes and exports the
//! child-facing ends as handle arguments. The child opens them with
//! [`PipeClient`]. After a one-byte handshake either side can send messages
//! from any thread while a single receive loop hands each inbound message to
//! a callback as a bounded [`Message`] stream.
//!
//! ```no_run
//! use std::process::Command;
//! use std::time::Duration;
//!
//! use anonpipes_endpoint::{Endpoint, PipeServer};
//!
//! # fn main() -> anonpipes_endpoint::Result<()> {
//! let server = PipeServer::new()?;
//! let receiver = server.receive_async(|message| {
//!     let payload = message.read_to_end()?;
//!     println!("child says {} bytes", payload.len());
//!     Ok(())
//! })?;
//!
//! let mut child = Command::new("child-program").args(server.client_args()).spawn()?;
//! server.wait_for_client(Some(Duration::from_secs(5)))?;
//! server.send(b"hello")?;
//! server.wait_for_transmission_end()?;
//! server.dispose();
//! # let _ = (receiver, child.wait());
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod client;
pub mod config;
mod engine;
pub mod endpoint;
pub mod error;
pub mod notify;
pub mod server;
pub mod state;

pub use args::{ClientHandles, IN_PIPE_HANDLE_ARG, OUT_PIPE_HANDLE_ARG};
pub use client::PipeClient;
pub use config::{
    EndpointConfig, ServerConfig, DEFAULT_DRAIN_POLL_INTERVAL, DEFAULT_RECEIVE_THREAD_NAME,
};
pub use engine::{CallbackResult, EndpointCore, Message};
pub use endpoint::Endpoint;
pub use error::{EndpointError, Result};
pub use notify::Notifier;
pub use server::PipeServer;
pub use state::ConnectionState;
