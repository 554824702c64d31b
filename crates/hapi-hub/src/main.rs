use anyhow::{Context, Result};
use hapi_core::config::Config;
use hapi_hub::daemon::Daemon;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    hapi_telemetry::logging::init_logging("hapi-hub", "info");

    let config = Config::load().context("failed to load hub configuration")?;
    info!(host = %config.daemon.host, port = config.daemon.port, "starting hub");

    let daemon = Daemon::new(config).await.context("failed to initialize hub")?;
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
            return;
        }
        info!("ctrl-c received, shutting down");
        shutdown.trigger();
    });

    daemon.run().await
}
