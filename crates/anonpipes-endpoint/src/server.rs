use std::time::Duration;

use anonpipes_transport::{inbound_pipe, outbound_pipe};
use tracing::info;

use crate::args::ClientHandles;
use crate::client::PipeClient;
use crate::config::{EndpointConfig, ServerConfig};
use crate::endpoint::Endpoint;
use crate::engine::{ClientEnds, EndpointCore, Role};
use crate::error::{EndpointError, Result};
use crate::notify::Notifier;

/// The parent-process side of a pipe pair.
///
/// Creates both pipes and exports the child-facing ends as handle strings.
/// The server becomes connected only after it reads the client's CONNECT
/// byte, either on the receive thread or inside
/// [`wait_for_client`](Self::wait_for_client).
#[derive(Debug)]
pub struct PipeServer {
    core: EndpointCore,
    handles: ClientHandles,
}

impl PipeServer {
    /// Create a server for a client in a child process.
    pub fn new() -> Result<Self> {
        Self::with_config(ServerConfig::default(), Notifier::default())
    }

    pub fn with_config(config: ServerConfig, notifier: Notifier) -> Result<Self> {
        let (reader, client_output) = inbound_pipe()?;
        let (writer, client_input) = outbound_pipe()?;
        let handles = ClientHandles::new(client_input.handle_string(), client_output.handle_string());

        let ends = ClientEnds {
            input: client_input,
            output: client_output,
            release_after_handshake: config.release_client_handles,
        };

        let core = EndpointCore::new(
            Role::Server,
            reader,
            writer,
            config.endpoint,
            notifier,
            Some(ends),
        );
        info!(
            input = %handles.input,
            output = %handles.output,
            "pipe server created"
        );
        Ok(Self { core, handles })
    }

    /// Handle of the pipe the client reads from.
    pub fn client_input_handle(&self) -> &str {
        &self.handles.input
    }

    /// Handle of the pipe the client writes to.
    pub fn client_output_handle(&self) -> &str {
        &self.handles.output
    }

    pub fn client_handles(&self) -> &ClientHandles {
        &self.handles
    }

    /// The two arguments to append to the child's command line.
    pub fn client_args(&self) -> [String; 2] {
        self.handles.to_args()
    }

    /// Open the client side in this process with default configuration.
    pub fn open_client(&self) -> Result<PipeClient> {
        self.open_client_with(EndpointConfig::default(), Notifier::default())
    }

    /// Open the client side in this process.
    ///
    /// The server's copies of the client ends move into the returned client,
    /// so this works once and only before the ends have been released. The
    /// exported handle strings then name descriptors owned by that client.
    pub fn open_client_with(
        &self,
        config: EndpointConfig,
        notifier: Notifier,
    ) -> Result<PipeClient> {
        let ends = self.core.take_client_ends().ok_or_else(|| {
            EndpointError::InvalidState(
                "client pipe ends were already released or handed out".to_string(),
            )
        })?;
        let reader = ends.input.into_reader()?;
        let writer = ends.output.into_writer()?;
        PipeClient::from_pipes(reader, writer, config, notifier)
    }

    /// Block until the client has connected.
    ///
    /// With a receive loop running, waits for it to complete the handshake,
    /// up to `timeout` if given. Without one, reads the handshake byte on the
    /// calling thread; a timeout is then not supported and fails with
    /// `InvalidState`.
    pub fn wait_for_client(&self, timeout: Option<Duration>) -> Result<()> {
        self.core.wait_for_connect(timeout)
    }
}

impl Endpoint for PipeServer {
    fn core(&self) -> &EndpointCore {
        &self.core
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Instant;

    use anonpipes_transport::PipeWriter;

    use super::*;
    use crate::state::ConnectionState;

    fn pair() -> (PipeServer, PipeClient) {
        let server = PipeServer::new().unwrap();
        let client = server.open_client().unwrap();
        (server, client)
    }

    /// The raw client ends, for tests that play a misbehaving client.
    fn raw_client_ends(server: &PipeServer) -> (PipeWriter, anonpipes_transport::PipeReader) {
        let ends = server.core.take_client_ends().unwrap();
        (
            ends.output.into_writer().unwrap(),
            ends.input.into_reader().unwrap(),
        )
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    fn collector() -> (
        Arc<Mutex<Vec<Vec<u8>>>>,
        impl FnMut(&mut crate::Message<'_>) -> crate::CallbackResult + Send + 'static,
    ) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let callback = move |message: &mut crate::Message<'_>| -> crate::CallbackResult {
            let payload = message.read_to_end()?;
            sink.lock().unwrap().push(payload.to_vec());
            Ok(())
        };
        (received, callback)
    }

    #[test]
    fn client_args_name_both_handles() {
        let server = PipeServer::new().unwrap();
        let args = server.client_args();
        assert_eq!(
            args[0],
            format!("--InPipeHandle={}", server.client_input_handle())
        );
        assert_eq!(
            args[1],
            format!("--OutPipeHandle={}", server.client_output_handle())
        );
        assert_eq!(server.state(), ConnectionState::Created);
    }

    #[test]
    fn wait_for_client_with_receive_loop() {
        let (server, client) = pair();
        let handle = server.receive_async(|_| Ok(())).unwrap();

        server
            .wait_for_client(Some(Duration::from_millis(1000)))
            .unwrap();
        assert!(server.is_connected());
        assert!(client.is_connected());
        assert_eq!(server.state(), ConnectionState::Connected);

        client.dispose();
        handle.join().unwrap().unwrap();
        assert_eq!(server.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn wait_for_client_times_out_without_client() {
        let server = PipeServer::new().unwrap();
        let handle = server.receive_async(|_| Ok(())).unwrap();

        let err = server
            .wait_for_client(Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, EndpointError::Timeout(_)));
        assert_eq!(
            err.to_string(),
            "pipe client failed to connect within the specified amount of time"
        );

        // Releasing the client ends lets the blocked handshake read see EOF.
        server.dispose();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn dispose_interrupts_wait_for_client() {
        let server = Arc::new(PipeServer::new().unwrap());
        let handle = server.receive_async(|_| Ok(())).unwrap();

        let waiter = {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                let started = Instant::now();
                let result = server.wait_for_client(Some(Duration::from_millis(1000)));
                (result, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        server.dispose();
        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(EndpointError::Disposed)));
        assert!(elapsed < Duration::from_millis(900));
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn wait_for_client_on_disposed_server() {
        let server = PipeServer::new().unwrap();
        server.dispose();
        assert!(matches!(
            server.wait_for_client(None),
            Err(EndpointError::Disposed)
        ));
        assert!(matches!(
            server.receive(|_| Ok(())),
            Err(EndpointError::Disposed)
        ));
    }

    #[test]
    fn timeout_requires_receive_loop() {
        let server = PipeServer::new().unwrap();
        let err = server
            .wait_for_client(Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, EndpointError::InvalidState(_)));
    }

    #[test]
    fn blocking_handshake_on_caller_thread() {
        let (server, client) = pair();
        server.wait_for_client(None).unwrap();
        assert!(server.is_connected());

        // The receive loop must not expect a second CONNECT.
        let (received, callback) = collector();
        let handle = server.receive_async(callback).unwrap();
        client.send(b"after handshake").unwrap();
        client.wait_for_transmission_end().unwrap();
        assert!(wait_until(Duration::from_secs(5), || received
            .lock()
            .unwrap()
            .len()
            == 1));

        drop(client);
        handle.join().unwrap().unwrap();
        assert_eq!(received.lock().unwrap()[0], b"after handshake");
    }

    #[test]
    fn server_can_send_before_the_handshake() {
        let (server, client) = pair();
        let server = Arc::new(server);
        let (received, callback) = collector();
        let handle = client.receive_async(callback).unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                let _ = done_tx.send(server.send(b"early"));
            });
        }
        let sent = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("send before the handshake must not block");
        sent.unwrap();
        assert!(wait_until(Duration::from_secs(5), || received
            .lock()
            .unwrap()
            .len()
            == 1));
        assert_eq!(received.lock().unwrap()[0], b"early");
        assert_eq!(server.state(), ConnectionState::Created);

        server.wait_for_client(None).unwrap();
        server.dispose();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn open_client_hands_out_the_ends_once() {
        let server = PipeServer::new().unwrap();
        let _client = server.open_client().unwrap();
        assert!(matches!(
            server.open_client(),
            Err(EndpointError::InvalidState(_))
        ));

        let disposed = PipeServer::new().unwrap();
        disposed.dispose();
        assert!(matches!(
            disposed.open_client(),
            Err(EndpointError::InvalidState(_))
        ));
    }

    #[test]
    fn kept_client_ends_are_closed_on_dispose() {
        let config = ServerConfig {
            release_client_handles: false,
            ..ServerConfig::default()
        };
        let server = PipeServer::with_config(config, Notifier::new()).unwrap();
        let handle = server.receive_async(|_| Ok(())).unwrap();

        // The handshake read only sees EOF once the server's copies are gone.
        server.dispose();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let _ = done_tx.send(handle.join().unwrap());
        });
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("receive loop should end after dispose")
            .unwrap();
    }

    #[test]
    fn bad_handshake_byte_disposes_server() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let server = PipeServer::with_config(
            ServerConfig::default(),
            Notifier::new().on_error(move |err| {
                assert!(matches!(err, EndpointError::HandshakeFailed(_)));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        let (mut rogue, _client_input) = raw_client_ends(&server);

        let handle = server.receive_async(|_| Ok(())).unwrap();
        rogue.write_all(&[anonpipes_frame::DATA]).unwrap();

        let err = server
            .wait_for_client(Some(Duration::from_millis(1000)))
            .unwrap_err();
        assert!(matches!(err, EndpointError::HandshakeFailed(_)));

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(EndpointError::HandshakeFailed(_))));
        assert!(server.is_disposed());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bad_handshake_byte_on_caller_thread() {
        let server = PipeServer::new().unwrap();
        let (mut rogue, _client_input) = raw_client_ends(&server);
        rogue.write_all(&[0x42]).unwrap();

        let err = server.wait_for_client(None).unwrap_err();
        assert!(matches!(err, EndpointError::HandshakeFailed(msg) if msg.contains("0x42")));
        assert!(server.is_disposed());
        assert!(!server.pipes_connected());
    }

    #[test]
    fn notifications_fire_once() {
        let connected = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));
        let (c, d) = (Arc::clone(&connected), Arc::clone(&disconnected));
        let server = PipeServer::with_config(
            ServerConfig::default(),
            Notifier::new()
                .on_connected(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .on_disconnected(move || {
                    d.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();
        let client = server.open_client().unwrap();

        let handle = server.receive_async(|_| Ok(())).unwrap();
        server.wait_for_client(None).unwrap();
        drop(client);
        handle.join().unwrap().unwrap();
        server.dispose();

        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn messages_arrive_in_order_with_exact_lengths() {
        let (server, client) = pair();
        let (received, callback) = collector();
        let handle = server.receive_async(callback).unwrap();
        server.wait_for_client(None).unwrap();

        let payloads: Vec<Vec<u8>> = (0..50u8)
            .map(|i| (0..i as usize * 37).map(|j| (j as u8) ^ i).collect())
            .collect();
        for payload in &payloads {
            client.send(payload).unwrap();
        }
        client.wait_for_transmission_end().unwrap();
        drop(client);
        handle.join().unwrap().unwrap();

        // The empty first payload is never sent.
        assert_eq!(*received.lock().unwrap(), payloads[1..].to_vec());
    }

    #[test]
    fn send_after_peer_disconnect_fails() {
        let (server, client) = pair();
        let handle = server.receive_async(|_| Ok(())).unwrap();
        server.wait_for_client(None).unwrap();

        let client_handle = client.receive_async(|_| Ok(())).unwrap();
        server.dispose();
        client_handle.join().unwrap().unwrap();

        assert_eq!(client.state(), ConnectionState::Disconnected);
        let err = client.send(b"too late").unwrap_err();
        assert!(matches!(err, EndpointError::Io(_)));
        assert!(matches!(server.send(b"x"), Err(EndpointError::Disposed)));

        drop(client);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn duplex_echo_from_callback() {
        let (server, client) = pair();
        let client = Arc::new(client);

        let echo = Arc::clone(&client);
        let client_handle = client
            .receive_async(move |message| {
                let payload = message.read_to_end()?;
                echo.send(&payload)?;
                Ok(())
            })
            .unwrap();

        let (received, callback) = collector();
        let server_handle = server.receive_async(callback).unwrap();
        server.wait_for_client(None).unwrap();

        for i in 0..100u32 {
            server.send(&i.to_le_bytes()).unwrap();
        }
        server.wait_for_transmission_end().unwrap();
        assert!(wait_until(Duration::from_secs(10), || received
            .lock()
            .unwrap()
            .len()
            == 100));

        server.dispose();
        client_handle.join().unwrap().unwrap();
        client.dispose();
        server_handle.join().unwrap().unwrap();

        let echoed: Vec<u32> = received
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| u32::from_le_bytes(bytes.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(echoed, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_senders_never_interleave() {
        let (server, client) = pair();
        let (received, callback) = collector();
        let handle = server.receive_async(callback).unwrap();
        server.wait_for_client(None).unwrap();

        let client = Arc::new(client);
        let senders: Vec<_> = (0..4u8)
            .map(|id| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    for n in 0..250u32 {
                        let mut payload = vec![id; 1024];
                        payload[..4].copy_from_slice(&n.to_le_bytes());
                        client.send(&payload).unwrap();
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().unwrap();
        }
        client.wait_for_transmission_end().unwrap();
        client.dispose();
        handle.join().unwrap().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1000);
        let mut next = [0u32; 4];
        for payload in received.iter() {
            assert_eq!(payload.len(), 1024);
            let id = payload[4];
            assert!(payload[4..].iter().all(|b| *b == id));
            let n = u32::from_le_bytes(payload[..4].try_into().unwrap());
            assert_eq!(n, next[id as usize], "per-sender order");
            next[id as usize] += 1;
        }
    }

    #[test]
    fn ten_thousand_messages_each_way() {
        const COUNT: u32 = 10_000;
        let (server, client) = pair();

        let (server_received, server_callback) = collector();
        let (client_received, client_callback) = collector();
        let server_handle = server.receive_async(server_callback).unwrap();
        let client_handle = client.receive_async(client_callback).unwrap();
        server.wait_for_client(None).unwrap();

        let server = Arc::new(server);
        let client = Arc::new(client);
        let to_client = {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                for i in 0..COUNT {
                    server.send(&i.to_le_bytes()).unwrap();
                }
            })
        };
        let to_server = {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for i in 0..COUNT {
                    client.send(&i.to_le_bytes()).unwrap();
                }
            })
        };
        to_client.join().unwrap();
        to_server.join().unwrap();
        server.wait_for_transmission_end().unwrap();
        client.wait_for_transmission_end().unwrap();

        let complete = |received: &Arc<Mutex<Vec<Vec<u8>>>>| {
            received.lock().unwrap().len() == COUNT as usize
        };
        assert!(wait_until(Duration::from_secs(30), || complete(&server_received)
            && complete(&client_received)));

        server.dispose();
        client.dispose();
        server_handle.join().unwrap().unwrap();
        client_handle.join().unwrap().unwrap();

        for received in [&server_received, &client_received] {
            let values: Vec<u32> = received
                .lock()
                .unwrap()
                .iter()
                .map(|bytes| u32::from_le_bytes(bytes.as_slice().try_into().unwrap()))
                .collect();
            assert_eq!(values, (0..COUNT).collect::<Vec<_>>());
        }
    }

    /// Produces `length` bytes without touching the buffer, except the very
    /// last byte which is 255.
    struct CountingSource {
        position: u64,
        length: u64,
    }

    impl Read for CountingSource {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = (self.length - self.position).min(buf.len() as u64) as usize;
            self.position += n as u64;
            if n > 0 && self.position == self.length {
                buf[n - 1] = 255;
            }
            Ok(n)
        }
    }

    #[test]
    fn stream_larger_than_two_gib() {
        let length = (1u64 << 31) + 3;
        let (server, client) = pair();

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let handle = server
            .receive_async(move |message| {
                let total = message.len();
                let mut buf = vec![0u8; 64 * 1024];
                let mut last = 0u8;
                while message.remaining() > 0 {
                    let n = message.read(&mut buf)?;
                    last = buf[n - 1];
                }
                *sink.lock().unwrap() = Some((total, message.position(), last));
                Ok(())
            })
            .unwrap();
        server.wait_for_client(None).unwrap();

        let mut source = CountingSource {
            position: 0,
            length,
        };
        client.send_stream(&mut source, length).unwrap();
        client.wait_for_transmission_end().unwrap();
        drop(client);
        handle.join().unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), Some((length, length, 255)));
    }
}
