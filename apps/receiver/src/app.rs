//! Application orchestrator: starts the server and waits for shutdown.

use dropline_server::{ServerState, TransferServer};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the receiver until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("SIGINT received, shutting down"),
            Err(e) => tracing::error!("failed to listen for Ctrl-C: {e}"),
        }
        signal_cancel.cancel();
    });

    serve(config, cancel).await
}

/// Runs the receiver until `cancel` fires.
pub async fn serve(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let server = TransferServer::new(config.server_config());
    let _subscription = server.state().subscribe(log_state);

    let addr = server.start().await?;
    tracing::info!(
        %addr,
        storage = %config.transfer.storage_dir.display(),
        "receiver ready"
    );

    cancel.cancelled().await;

    tracing::info!("stopping server...");
    server.stop().await;
    Ok(())
}

fn log_state(state: &ServerState) {
    match &state.transfer {
        Some(progress) => tracing::info!(
            status = ?state.status,
            file = %progress.file_name,
            chunks = format_args!("{}/{}", progress.received_chunks, progress.total_chunks),
            percent = format_args!("{:.1}", progress.percentage()),
            "transfer progress"
        ),
        None => tracing::info!(
            status = ?state.status,
            client = state.client.as_ref().map(|c| c.device_name.as_str()),
            error = state.error.as_deref(),
            "state changed"
        ),
    }
}
