use std::fmt;

use crate::error::EndpointError;

type Handler = Box<dyn Fn() + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&EndpointError) + Send + Sync>;

/// Connection event handlers, fixed at endpoint construction.
///
/// At most one handler per kind. Handlers run on whichever thread caused the
/// event (usually the receive thread) and never while endpoint locks are held,
/// so they may call back into the endpoint.
#[derive(Default)]
pub struct Notifier {
    connected: Option<Handler>,
    disconnected: Option<Handler>,
    error: Option<ErrorHandler>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once when the endpoint becomes connected.
    pub fn on_connected(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.connected = Some(Box::new(handler));
        self
    }

    /// Called once when the endpoint becomes disconnected, for any reason.
    pub fn on_disconnected(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.disconnected = Some(Box::new(handler));
        self
    }

    /// Called for callback failures and receive loop errors.
    pub fn on_error(mut self, handler: impl Fn(&EndpointError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(handler));
        self
    }

    pub(crate) fn connected(&self) {
        if let Some(handler) = &self.connected {
            handler();
        }
    }

    pub(crate) fn disconnected(&self) {
        if let Some(handler) = &self.disconnected {
            handler();
        }
    }

    pub(crate) fn error(&self, err: &EndpointError) {
        if let Some(handler) = &self.error {
            handler(err);
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("connected", &self.connected.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}
