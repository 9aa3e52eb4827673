use std::time::Duration;

use anonpipes_frame::FrameConfig;

/// Default interval between drain polls once the initial spin is over.
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default name of the background receive thread.
pub const DEFAULT_RECEIVE_THREAD_NAME: &str = "anonpipes-receive";

/// Configuration shared by clients and servers.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Block in `send` until the peer has read every byte written. Default: true.
    pub drain_after_send: bool,
    /// Sleep between drain polls. Default: 1ms.
    pub drain_poll_interval: Duration,
    /// Name for the thread spawned by `receive_async`.
    pub thread_name: String,
    /// Frame writer settings (stream chunk size).
    pub frame: FrameConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            drain_after_send: true,
            drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
            thread_name: DEFAULT_RECEIVE_THREAD_NAME.to_string(),
            frame: FrameConfig::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: EndpointConfig,
    /// Close the server's copies of the child-facing pipe ends once the
    /// handshake byte has been read. When false they are kept until the
    /// server is disposed. Default: true.
    ///
    /// Either way a client opened in this process with
    /// [`PipeServer::open_client`](crate::PipeServer::open_client) takes the
    /// ends over, and the server no longer holds them.
    pub release_client_handles: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            release_client_handles: true,
        }
    }
}

