//! Dropline desktop receiver entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Structured logging, RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting Dropline receiver"
    );

    // Created with defaults on first run.
    let config = config::Config::load()?;
    tracing::info!(
        name = %config.name,
        storage = %config.transfer.storage_dir.display(),
        "configuration loaded"
    );

    // Runs until Ctrl-C.
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("receiver shut down cleanly");
    Ok(())
}
