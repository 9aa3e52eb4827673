//! Send/receive engine shared by clients and servers.

use std::any::Any;
use std::fmt;
use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anonpipes_frame::{
    control_name, ControlByte, FrameReader, FrameWriter, MessageStream, Result as FrameResult,
    CONNECT,
};
use anonpipes_transport::{InheritableHandle, PipeReader, PipeWriter};
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::error::{EndpointError, Result};
use crate::notify::Notifier;
use crate::state::ConnectionState;

/// The bounded view handed to receive callbacks, one per data frame.
pub type Message<'a> = MessageStream<'a, PipeReader>;

/// What a receive callback returns. Errors are reported, never fatal.
pub type CallbackResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Server-held copies of the pipe ends given to the child.
pub(crate) struct ClientEnds {
    pub(crate) input: InheritableHandle,
    pub(crate) output: InheritableHandle,
    // Otherwise they are kept until dispose.
    pub(crate) release_after_handshake: bool,
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    disposed: bool,
    broken: bool,
    sending: bool,
    dispatching: bool,
    receiver_started: bool,
    handshake_failure: Option<String>,
}

struct Shared {
    role: Role,
    config: EndpointConfig,
    notifier: Notifier,
    status: Mutex<Status>,
    changed: Condvar,
    // Mirrors `Status::disposed` for drain polling without the status lock.
    disposed: AtomicBool,
    // Also the send lock: held for the whole of a frame write and its drain.
    writer: Mutex<Option<FrameWriter<PipeWriter>>>,
    // Taken by the receive loop for its lifetime.
    reader: Mutex<Option<FrameReader<PipeReader>>>,
    client_ends: Mutex<Option<ClientEnds>>,
}

/// Shared endpoint engine: one outbound pipe, one inbound pipe, the
/// connection state machine and the receive loop.
///
/// Sends from any number of threads are serialized so frames never
/// interleave. At most one receive loop runs per endpoint lifetime.
pub struct EndpointCore {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EndpointCore {
    pub(crate) fn new(
        role: Role,
        reader: PipeReader,
        writer: PipeWriter,
        config: EndpointConfig,
        notifier: Notifier,
        client_ends: Option<ClientEnds>,
    ) -> Self {
        let frame_config = config.frame.clone();
        Self {
            shared: Arc::new(Shared {
                role,
                config,
                notifier,
                status: Mutex::new(Status {
                    state: ConnectionState::Created,
                    disposed: false,
                    broken: false,
                    sending: false,
                    dispatching: false,
                    receiver_started: false,
                    handshake_failure: None,
                }),
                changed: Condvar::new(),
                disposed: AtomicBool::new(false),
                writer: Mutex::new(Some(FrameWriter::with_config(writer, frame_config))),
                reader: Mutex::new(Some(FrameReader::new(reader))),
                client_ends: Mutex::new(client_ends),
            }),
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        lock(&self.shared.status)
    }

    fn role(&self) -> &'static str {
        self.shared.role.as_str()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    /// True while connected and not disposed.
    pub fn is_connected(&self) -> bool {
        let status = self.status();
        status.state == ConnectionState::Connected && !status.disposed
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// False once disposed or after a pipe failure.
    pub fn pipes_connected(&self) -> bool {
        let status = self.status();
        !status.disposed && !status.broken
    }

    pub(crate) fn mark_connected(&self) {
        let changed = {
            let mut status = self.status();
            if status.state == ConnectionState::Created && !status.disposed {
                status.state = ConnectionState::Connected;
                true
            } else {
                false
            }
        };
        if changed {
            self.shared.changed.notify_all();
            info!(role = self.role(), "connected");
            self.shared.notifier.connected();
        }
    }

    fn set_disconnected(&self) {
        let changed = {
            let mut status = self.status();
            if status.state == ConnectionState::Disconnected {
                false
            } else {
                status.state = ConnectionState::Disconnected;
                true
            }
        };
        self.shared.changed.notify_all();
        if changed {
            info!(role = self.role(), "disconnected");
            self.shared.notifier.disconnected();
        }
    }

    fn mark_broken(&self) {
        self.status().broken = true;
    }

    fn set_dispatching(&self, dispatching: bool) {
        self.status().dispatching = dispatching;
        self.shared.changed.notify_all();
    }

    fn report(&self, err: EndpointError) {
        warn!(role = self.role(), error = %err, "receive callback failed");
        self.shared.notifier.error(&err);
    }

    /// Write the CONNECT marker (client construction).
    pub(crate) fn send_connect(&self) -> Result<()> {
        let mut guard = lock(&self.shared.writer);
        let writer = guard.as_mut().ok_or(EndpointError::Disposed)?;
        writer.send_connect()?;
        debug!(role = self.role(), "sent CONNECT");
        Ok(())
    }

    /// Send one message. Empty payloads are not sent at all.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.send_with(|writer| writer.send(payload))
    }

    /// Send one message of exactly `length` bytes read from `source`.
    ///
    /// The payload is copied in chunks and never buffered whole. A source
    /// that ends early fails with `InvalidArgument` and leaves the pipe
    /// unusable, since the frame on the wire cannot be completed.
    pub fn send_stream(&self, source: &mut dyn Read, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        self.send_with(|writer| writer.send_from(source, length))
    }

    fn send_with(
        &self,
        write: impl FnOnce(&mut FrameWriter<PipeWriter>) -> FrameResult<()>,
    ) -> Result<()> {
        let mut guard = lock(&self.shared.writer);
        {
            let mut status = self.status();
            if status.disposed {
                return Err(EndpointError::Disposed);
            }
            if status.broken || status.state == ConnectionState::Disconnected {
                return Err(EndpointError::broken_pipe());
            }
            status.sending = true;
        }

        let result = match guard.as_mut() {
            Some(writer) => self.write_and_drain(writer, write),
            None => Err(EndpointError::Disposed),
        };

        self.status().sending = false;
        drop(guard);
        self.shared.changed.notify_all();

        if let Err(err) = &result {
            if !matches!(err, EndpointError::Disposed) {
                debug!(role = self.role(), error = %err, "send failed");
                self.mark_broken();
                self.set_disconnected();
            }
        }
        result
    }

    fn write_and_drain(
        &self,
        writer: &mut FrameWriter<PipeWriter>,
        write: impl FnOnce(&mut FrameWriter<PipeWriter>) -> FrameResult<()>,
    ) -> Result<()> {
        write(writer)?;
        if self.shared.config.drain_after_send {
            self.drain(writer)?;
        }
        Ok(())
    }

    fn drain(&self, writer: &FrameWriter<PipeWriter>) -> Result<()> {
        let drained = writer
            .get_ref()
            .wait_for_drain(self.shared.config.drain_poll_interval, || {
                self.shared.disposed.load(Ordering::Acquire)
            })?;
        if drained {
            Ok(())
        } else {
            Err(EndpointError::Disposed)
        }
    }

    /// Run the receive loop on the calling thread until the peer disconnects,
    /// the endpoint is disposed, or the stream becomes unreadable.
    pub fn receive<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&mut Message<'_>) -> CallbackResult,
    {
        let reader = self.start_receiving()?;
        self.run(reader, callback)
    }

    /// Run the receive loop on a new named thread.
    pub fn receive_async<F>(&self, callback: F) -> Result<JoinHandle<Result<()>>>
    where
        F: FnMut(&mut Message<'_>) -> CallbackResult + Send + 'static,
    {
        let reader = self.start_receiving()?;
        let core = EndpointCore {
            shared: Arc::clone(&self.shared),
        };
        let handle = std::thread::Builder::new()
            .name(self.shared.config.thread_name.clone())
            .spawn(move || core.run(reader, callback))?;
        Ok(handle)
    }

    fn start_receiving(&self) -> Result<FrameReader<PipeReader>> {
        {
            let mut status = self.status();
            if status.disposed {
                return Err(EndpointError::Disposed);
            }
            if status.receiver_started {
                return Err(EndpointError::InvalidState(
                    "a receive callback is already registered".to_string(),
                ));
            }
            status.receiver_started = true;
        }
        self.shared.changed.notify_all();
        lock(&self.shared.reader)
            .take()
            .ok_or(EndpointError::Disposed)
    }

    fn run<F>(&self, mut reader: FrameReader<PipeReader>, mut callback: F) -> Result<()>
    where
        F: FnMut(&mut Message<'_>) -> CallbackResult,
    {
        debug!(role = self.role(), "receive loop started");
        let result = self.receive_loop(&mut reader, &mut callback);
        drop(reader);

        match result {
            Ok(()) => {
                debug!(role = self.role(), "receive loop finished");
                Ok(())
            }
            Err(err) => {
                warn!(role = self.role(), error = %err, "receive loop aborted");
                self.shared.notifier.error(&err);
                self.mark_broken();
                self.set_disconnected();
                Err(err)
            }
        }
    }

    fn receive_loop<F>(&self, reader: &mut FrameReader<PipeReader>, callback: &mut F) -> Result<()>
    where
        F: FnMut(&mut Message<'_>) -> CallbackResult,
    {
        if self.shared.role == Role::Server && self.state() == ConnectionState::Created {
            self.handshake(reader)?;
        }

        loop {
            if self.is_disposed() {
                debug!(role = self.role(), "disposed, leaving receive loop");
                return Ok(());
            }

            let Some(byte) = reader.read_control()? else {
                debug!(role = self.role(), "peer closed its pipe");
                self.mark_broken();
                self.set_disconnected();
                return Ok(());
            };

            match ControlByte::try_from(byte)? {
                ControlByte::Connect => {
                    debug!(role = self.role(), "ignoring CONNECT after handshake");
                }
                ControlByte::Disconnect => {
                    debug!(role = self.role(), "received DISCONNECT");
                    self.set_disconnected();
                    return Ok(());
                }
                ControlByte::Data => {
                    // In flight from the control byte on, length included.
                    self.set_dispatching(true);
                    let result = match reader.read_length() {
                        Ok(length) => self.dispatch(reader, length, callback),
                        Err(err) => Err(err.into()),
                    };
                    self.set_dispatching(false);
                    result?;
                }
            }
        }
    }

    fn dispatch<F>(
        &self,
        reader: &mut FrameReader<PipeReader>,
        length: u64,
        callback: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&mut Message<'_>) -> CallbackResult,
    {
        debug!(role = self.role(), length, "dispatching message");
        let mut message = reader.message(length);
        match catch_unwind(AssertUnwindSafe(|| callback(&mut message))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.report(EndpointError::Callback(err)),
            Err(panic) => self.report(EndpointError::CallbackPanicked(panic_message(
                panic.as_ref(),
            ))),
        }
        message.read_to_end_drop_bytes()?;
        Ok(())
    }

    fn handshake(&self, reader: &mut FrameReader<PipeReader>) -> Result<()> {
        debug!(role = self.role(), "waiting for client CONNECT");
        let byte = reader.read_control();
        self.release_client_ends_after_handshake();
        if self.is_disposed() {
            return Ok(());
        }

        let reason = match byte {
            Ok(Some(CONNECT)) => {
                self.mark_connected();
                return Ok(());
            }
            Ok(Some(other)) => format!(
                "expected CONNECT, received {} (0x{other:02x})",
                control_name(other)
            ),
            Ok(None) => "client closed its pipe before connecting".to_string(),
            Err(err) => err.to_string(),
        };

        warn!(role = self.role(), reason = %reason, "handshake failed");
        self.status().handshake_failure = Some(reason.clone());
        self.dispose();
        Err(EndpointError::HandshakeFailed(reason))
    }

    pub(crate) fn wait_for_connect(&self, timeout: Option<Duration>) -> Result<()> {
        let mut status = self.status();
        if let Some(reason) = &status.handshake_failure {
            return Err(EndpointError::HandshakeFailed(reason.clone()));
        }
        if status.disposed {
            return Err(EndpointError::Disposed);
        }
        if status.state == ConnectionState::Connected {
            return Ok(());
        }

        if !status.receiver_started {
            if timeout.is_some() {
                return Err(EndpointError::InvalidState(
                    "a timeout requires a running receive loop".to_string(),
                ));
            }
            drop(status);
            return self.handshake_on_caller();
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if status.state == ConnectionState::Connected {
                return Ok(());
            }
            if let Some(reason) = &status.handshake_failure {
                return Err(EndpointError::HandshakeFailed(reason.clone()));
            }
            if status.disposed {
                return Err(EndpointError::Disposed);
            }
            if status.state == ConnectionState::Disconnected {
                return Err(EndpointError::HandshakeFailed(
                    "pipes closed before the client connected".to_string(),
                ));
            }

            status = match deadline {
                None => self
                    .shared
                    .changed
                    .wait(status)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(EndpointError::Timeout(timeout.unwrap_or_default()));
                    }
                    self.shared
                        .changed
                        .wait_timeout(status, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn handshake_on_caller(&self) -> Result<()> {
        let mut guard = lock(&self.shared.reader);
        let Some(reader) = guard.as_mut() else {
            return Err(if self.is_disposed() {
                EndpointError::Disposed
            } else {
                EndpointError::InvalidState("the receive loop owns the inbound pipe".to_string())
            });
        };
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let result = self.handshake(reader);
        if result.is_err() {
            guard.take();
        }
        result?;
        if self.state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(EndpointError::Disposed)
        }
    }

    fn release_client_ends_after_handshake(&self) {
        let mut slot = lock(&self.shared.client_ends);
        if slot.as_ref().is_some_and(|ends| ends.release_after_handshake) {
            let ends = slot.take();
            drop(slot);
            close_client_ends(ends);
        }
    }

    fn release_client_ends(&self) {
        let ends = lock(&self.shared.client_ends).take();
        close_client_ends(ends);
    }

    /// Hand the client ends to the caller instead of closing them.
    pub(crate) fn take_client_ends(&self) -> Option<ClientEnds> {
        if self.is_disposed() {
            return None;
        }
        lock(&self.shared.client_ends).take()
    }

    /// Wait for outbound bytes to drain, then until no send is in progress
    /// and the receive loop is between messages.
    ///
    /// Returns early once the endpoint is disposed or disconnected. This is
    /// a best-effort quiescence point, not a strict flush barrier.
    pub fn wait_for_transmission_end(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(EndpointError::Disposed);
        }

        {
            let guard = lock(&self.shared.writer);
            if let Some(writer) = guard.as_ref() {
                if let Err(err) = self.drain(writer) {
                    debug!(role = self.role(), error = %err, "drain before transmission end failed");
                }
            }
        }

        let mut status = self.status();
        while (status.sending || status.dispatching)
            && !status.disposed
            && status.state != ConnectionState::Disconnected
        {
            status = self
                .shared
                .changed
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    /// Tell the peer we are leaving and release the pipes. Idempotent.
    ///
    /// A receive loop blocked in a read keeps its pipe until the peer
    /// disconnects or closes.
    pub fn dispose(&self) {
        {
            let mut status = self.status();
            if status.disposed {
                return;
            }
            status.disposed = true;
            self.shared.disposed.store(true, Ordering::Release);
        }
        self.shared.changed.notify_all();
        debug!(role = self.role(), "disposing");

        if let Some(mut writer) = lock(&self.shared.writer).take() {
            if let Err(err) = writer.send_disconnect() {
                debug!(role = self.role(), error = %err, "failed to send DISCONNECT");
            }
        }
        if let Ok(mut reader) = self.shared.reader.try_lock() {
            reader.take();
        }
        self.release_client_ends();
        self.set_disconnected();
    }
}

impl fmt::Debug for EndpointCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("EndpointCore")
            .field("role", &self.shared.role)
            .field("state", &status.state)
            .field("disposed", &status.disposed)
            .field("broken", &status.broken)
            .finish()
    }
}

fn close_client_ends(ends: Option<ClientEnds>) {
    if let Some(ends) = ends {
        debug!(
            input = %ends.input.handle_string(),
            output = %ends.output.handle_string(),
            "closing local copies of client pipe ends"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
