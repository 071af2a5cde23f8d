use mimalloc::MiMalloc;
use tracing::info;

use stitch_relay::{RelayConfig, RelayServer, logging};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = RelayConfig::from_env_or_default();
    let _log_guard = logging::init_logging(config.log_dir.as_deref())?;

    info!(
        address = %config.socket_address(),
        allow_private_targets = config.allow_private_targets,
        "Starting stitch-relay v{}",
        env!("CARGO_PKG_VERSION")
    );

    let server = RelayServer::new(config)?;
    let cancel_token = server.cancel_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        cancel_token.cancel();
    });

    server.run().await?;
    Ok(())
}
