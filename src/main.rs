//! Thin CLI shim: parse arguments, stand up a `Session`, run until Ctrl-C or
//! the peer drops, shut down in order. Everything that matters lives in the
//! library crate so it can be exercised directly from tests.

use anyhow::{Context, Result};
use tracing::{error, info};

use voxlink::config::{parse_cli, PreprocessorConfig};
use voxlink::session::Session;

#[tokio::main]
async fn main() -> Result<()> {
    let log_guard = voxlink::logging::init("logs", "voxlink.log").context("initialize logging")?;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("panic occurred: {}", panic_info);
    }));

    let cli = match parse_cli() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            eprintln!(
                "usage: voxlink <remote_ip> <local_port> <remote_port> [--device NAME]\n   or: voxlink -s|--server [PORT] [--device NAME]\n   or: voxlink -c|--client IP [PORT] [--device NAME]"
            );
            std::process::exit(1);
        }
    };

    let mut session = Session::with_logging(cli, PreprocessorConfig::default(), log_guard)
        .await
        .context("build session")?;

    if let Err(e) = session.start() {
        error!("failed to start session: {e}");
        return Err(e.into());
    }

    info!("voxlink running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    info!("shutting down");
    session.shutdown().await;
    Ok(())
}
