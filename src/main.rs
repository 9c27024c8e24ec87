//! echoline: a multi-client line-oriented TCP echo server
//!
//! Clients send newline-delimited text and get it echoed back. A line
//! starting with a `HH:MM:SS.mmm` stamp is a latency probe and comes
//! back annotated with the measured delay. Control lines:
//! - `?` prints the help string
//! - `Bye.` closes that client's session
//! - `End Server.` shuts the whole server down
//!
//! Every session runs a heartbeat that flags scheduling delays.
//! Configuration via CLI arguments or TOML file.

mod clock;
mod config;
mod events;
mod heartbeat;
mod server;
mod session;

use std::sync::Arc;

use config::Config;
use events::TracingSink;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        heartbeat_interval_ms = config.heartbeat_interval_ms,
        "Starting echoline server"
    );

    let server = Server::new(config, Arc::new(TracingSink));
    let addr = server.start().await?;
    info!(address = %addr, "Server ready");

    // The process runs until Ctrl-C; a remote `End Server.` stops the
    // listener but keeps the process alive so the host can restart.
    run_until_signalled(&server).await?;
    info!("Ctrl-C received, shutting down");
    server.shutdown().await;

    Ok(())
}

/// Wait for Ctrl-C. On Unix, SIGHUP cycles the server on the same port.
#[cfg(unix)]
async fn run_until_signalled(server: &Server) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => return res,
            _ = hangup.recv() => {
                match server.restart().await {
                    Ok(addr) => info!(address = %addr, "Server restarted"),
                    Err(e) => tracing::error!(error = %e, "Restart failed"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn run_until_signalled(_server: &Server) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
