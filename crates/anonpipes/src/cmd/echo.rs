use std::sync::Arc;

use anonpipes::{Endpoint, PipeClient};

use crate::cmd::EchoArgs;
use crate::exit::{endpoint_error, CliError, CliResult, INTERNAL, INTERRUPTED, SUCCESS};

pub fn run(args: EchoArgs) -> CliResult<i32> {
    let client = Arc::new(
        PipeClient::from_args(&args.handles).map_err(|err| endpoint_error("open failed", err))?,
    );
    install_ctrlc_handler(Arc::clone(&client))?;

    client
        .receive(|message| {
            let payload = message.read_to_end()?;
            tracing::info!(size = payload.len(), "echoing message");
            client.send(&payload)?;
            Ok(())
        })
        .map_err(|err| endpoint_error("receive failed", err))?;

    tracing::debug!(state = %client.state(), "host went away");
    client.dispose();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(client: Arc<PipeClient>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        client.dispose();
        std::process::exit(INTERRUPTED);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
