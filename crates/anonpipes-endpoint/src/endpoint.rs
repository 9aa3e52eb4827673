use std::io::Read;
use std::thread::JoinHandle;

use crate::engine::{CallbackResult, EndpointCore, Message};
use crate::error::Result;
use crate::state::ConnectionState;

/// Operations shared by [`PipeClient`](crate::PipeClient) and
/// [`PipeServer`](crate::PipeServer).
///
/// Implementors only expose their [`EndpointCore`]; everything else is
/// provided.
pub trait Endpoint {
    fn core(&self) -> &EndpointCore;

    /// Send one message. Blocks until the peer has read it when draining is
    /// enabled. Empty payloads are not sent.
    fn send(&self, payload: &[u8]) -> Result<()> {
        self.core().send(payload)
    }

    /// Send one message of exactly `length` bytes read from `source`.
    fn send_stream(&self, source: &mut dyn Read, length: u64) -> Result<()> {
        self.core().send_stream(source, length)
    }

    /// Run the receive loop on the calling thread.
    ///
    /// The callback gets one [`Message`] per data frame. Unread bytes are
    /// discarded after it returns. Errors and panics from the callback go to
    /// the error handler and the loop keeps running.
    fn receive<F>(&self, callback: F) -> Result<()>
    where
        Self: Sized,
        F: FnMut(&mut Message<'_>) -> CallbackResult,
    {
        self.core().receive(callback)
    }

    /// Run the receive loop on a background thread.
    fn receive_async<F>(&self, callback: F) -> Result<JoinHandle<Result<()>>>
    where
        Self: Sized,
        F: FnMut(&mut Message<'_>) -> CallbackResult + Send + 'static,
    {
        self.core().receive_async(callback)
    }

    fn wait_for_transmission_end(&self) -> Result<()> {
        self.core().wait_for_transmission_end()
    }

    fn dispose(&self) {
        self.core().dispose()
    }

    fn state(&self) -> ConnectionState {
        self.core().state()
    }

    fn is_connected(&self) -> bool {
        self.core().is_connected()
    }

    fn is_disposed(&self) -> bool {
        self.core().is_disposed()
    }

    fn pipes_connected(&self) -> bool {
        self.core().pipes_connected()
    }
}
