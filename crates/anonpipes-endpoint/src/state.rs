use std::fmt;

/// Connection lifecycle of an endpoint.
///
/// `Disconnected` is terminal: nothing moves an endpoint out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Pipes exist but no handshake has happened yet.
    Created,
    /// The handshake completed (server) or the CONNECT byte was written (client).
    Connected,
    /// Disposed, peer sent DISCONNECT, peer closed its pipe, or a transport error.
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Created => "created",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
