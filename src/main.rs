//! conn-pipeline: echo server on top of the per-connection pipeline.
//!
//! Features:
//! - One receive/dispatch/send pipeline per accepted connection
//! - Per-stage timeouts reported to the handle
//! - Bounded queues between stages
//! - Configuration via CLI arguments or TOML file

use conn_pipeline::echo::EchoHandle;
use conn_pipeline::{Config, Server};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
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
        listen = %config.listen,
        max_connections = config.max_connections,
        recv_queue = config.pipeline.recv_queue,
        dispatch_queue = config.pipeline.dispatch_queue,
        send_queue = config.pipeline.send_queue,
        recv_timeout_ms = config.pipeline.recv_timeout_ms,
        send_timeout_ms = config.pipeline.send_timeout_ms,
        dispatch_timeout_ms = config.pipeline.dispatch_timeout_ms,
        debug = config.pipeline.debug,
        "Starting conn-pipeline echo server"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!(error = %e, "Failed to listen for ctrl-c"),
        }
        signal.cancel();
    });

    let server = Server::new(config, EchoHandle);
    server.run(shutdown).await?;
    Ok(())
}
