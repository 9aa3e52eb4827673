use anonpipes_transport::{PipeReader, PipeWriter};
use tracing::info;

use crate::args::ClientHandles;
use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::engine::{EndpointCore, Role};
use crate::error::Result;
use crate::notify::Notifier;

/// The child-process side of a pipe pair.
///
/// Opening a client writes the CONNECT byte and marks the client connected
/// right away, without waiting for the server to read it.
#[derive(Debug)]
pub struct PipeClient {
    core: EndpointCore,
}

impl PipeClient {
    /// Open the pipes named by `handles` with default configuration.
    pub fn open(handles: &ClientHandles) -> Result<Self> {
        Self::open_with(handles, EndpointConfig::default(), Notifier::default())
    }

    /// Open the pipes named by the handle arguments in `args`.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::open(&ClientHandles::from_args(args)?)
    }

    /// Open the pipes named by the current process's arguments.
    pub fn from_env() -> Result<Self> {
        Self::from_args(std::env::args().skip(1))
    }

    pub fn open_with(
        handles: &ClientHandles,
        config: EndpointConfig,
        notifier: Notifier,
    ) -> Result<Self> {
        let reader = PipeReader::from_handle(&handles.input)?;
        let writer = PipeWriter::from_handle(&handles.output)?;
        let client = Self::from_pipes(reader, writer, config, notifier)?;
        info!(input = %handles.input, output = %handles.output, "pipe client opened");
        Ok(client)
    }

    pub(crate) fn from_pipes(
        reader: PipeReader,
        writer: PipeWriter,
        config: EndpointConfig,
        notifier: Notifier,
    ) -> Result<Self> {
        let core = EndpointCore::new(Role::Client, reader, writer, config, notifier, None);
        core.send_connect()?;
        core.mark_connected();
        Ok(Self { core })
    }
}

impl Endpoint for PipeClient {
    fn core(&self) -> &EndpointCore {
        &self.core
    }
}

impl Drop for PipeClient {
    fn drop(&mut self) {
        self.core.dispose();
    }
}
