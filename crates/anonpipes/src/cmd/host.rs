use std::io::BufRead;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anonpipes::{Endpoint, PipeServer};

use crate::cmd::{parse_duration, HostArgs};
use crate::exit::{
    endpoint_error, io_error, CliError, CliResult, FAILURE, INTERNAL, INTERRUPTED, SUCCESS,
    TIMEOUT,
};
use crate::output::{print_message, OutputFormat};

pub fn run(args: HostArgs, format: OutputFormat) -> CliResult<i32> {
    let connect_timeout = parse_duration(&args.connect_timeout)?;
    let reply_timeout = parse_duration(&args.reply_timeout)?;

    let server =
        Arc::new(PipeServer::new().map_err(|err| endpoint_error("pipe setup failed", err))?);
    install_ctrlc_handler(Arc::clone(&server))?;

    let (replies_tx, replies_rx) = mpsc::channel();
    let mut index = 0u64;
    let receiver = server
        .receive_async(move |message| {
            let payload = message.read_to_end()?;
            index += 1;
            print_message(index, &payload, format);
            let _ = replies_tx.send(());
            Ok(())
        })
        .map_err(|err| endpoint_error("receive setup failed", err))?;

    let mut child = Command::new(&args.program)
        .args(&args.args)
        .args(server.client_args())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .spawn()
        .map_err(|err| io_error(&format!("failed to spawn {}", args.program), err))?;
    tracing::info!(program = %args.program, pid = child.id(), "spawned client");

    if let Err(err) = server.wait_for_client(Some(connect_timeout)) {
        server.dispose();
        stop_child(&mut child);
        return Err(endpoint_error("client did not connect", err));
    }

    let sent = match send_stdin_lines(&server) {
        Ok(sent) => sent,
        Err(err) => {
            server.dispose();
            stop_child(&mut child);
            return Err(err);
        }
    };
    tracing::info!(sent, "finished sending");

    let waited = if args.wait_replies {
        wait_for_replies(&replies_rx, sent, reply_timeout)
    } else {
        Ok(())
    };

    if let Err(err) = server.wait_for_transmission_end() {
        tracing::debug!(error = %err, "transmission end wait failed");
    }
    server.dispose();

    match receiver.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "receive loop ended with error"),
        Err(_) => return Err(CliError::new(INTERNAL, "receive thread panicked")),
    }

    let status = child
        .wait()
        .map_err(|err| io_error("failed waiting for client", err))?;
    waited?;

    if status.success() {
        Ok(SUCCESS)
    } else {
        tracing::warn!(%status, "client exited with failure");
        Ok(FAILURE)
    }
}

fn send_stdin_lines(server: &PipeServer) -> CliResult<usize> {
    let mut sent = 0usize;
    for line in std::io::stdin().lock().lines() {
        let line = line.map_err(|err| io_error("failed reading stdin", err))?;
        if line.is_empty() {
            continue;
        }
        server
            .send(line.as_bytes())
            .map_err(|err| endpoint_error("send failed", err))?;
        sent += 1;
    }
    Ok(sent)
}

fn wait_for_replies(replies: &Receiver<()>, expected: usize, timeout: Duration) -> CliResult<()> {
    let deadline = Instant::now() + timeout;
    for received in 0..expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        replies.recv_timeout(remaining).map_err(|_| {
            CliError::new(
                TIMEOUT,
                format!("received {received} of {expected} replies before timeout"),
            )
        })?;
    }
    Ok(())
}

fn stop_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn install_ctrlc_handler(server: Arc<PipeServer>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        server.dispose();
        std::process::exit(INTERRUPTED);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
