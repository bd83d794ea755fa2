//! Pixelpool worker process.
//!
//! Hosts a single execution context. Commands arrive on stdin and responses
//! leave on stdout, both as length-prefixed rkyv frames. Logs go to stderr so
//! they never corrupt the protocol stream.

use std::io::{self, BufReader, BufWriter};
use std::sync::Arc;

use anyhow::Context;
use pixelpool_core::protocol::{
    MAX_FRAME_LEN, encode_response, read_message, write_frame, write_message,
};
use pixelpool_core::{ContextCommand, ContextHandler, ContextResponse, Error, ImageCodecLoader};

fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let mut stdin = BufReader::new(io::stdin().lock());
    let mut stdout = BufWriter::new(io::stdout().lock());
    let mut handler = ContextHandler::new(Arc::new(ImageCodecLoader));

    tracing::debug!("Worker {} started", std::process::id());

    loop {
        let command = match read_message::<_, ContextCommand>(&mut stdin) {
            Ok(command) => command,
            Err(Error::Serialization(reason)) => {
                // The parent is speaking something else; report it and stop.
                let response = ContextResponse::unscoped_error(format!(
                    "received malformed command: {}",
                    reason
                ));
                write_message(&mut stdout, &response)
                    .context("Failed to report malformed command")?;
                anyhow::bail!("received malformed command: {}", reason);
            }
            Err(e) => {
                // Parent closed the pipe.
                tracing::debug!("Worker stdin closed: {}", e);
                break;
            }
        };

        let Some(response) = handler.handle(command) else {
            tracing::debug!("Worker received shutdown");
            break;
        };

        // An output too large for one frame is answered as a failure of that request.
        let frame =
            encode_response(&response, MAX_FRAME_LEN).context("Failed to encode response")?;
        write_frame(&mut stdout, &frame).context("Failed to write response")?;
    }

    Ok(())
}
