use tokio_util::sync::CancellationToken;

/// Install a shutdown handler listening for SIGTERM / ctrl-c.
///
/// Returns a `CancellationToken` cancelled when either signal arrives. Every
/// background loop watches this token and drains gracefully; the node writes
/// its final heartbeat before the process exits.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received ctrl-c, initiating graceful shutdown");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received ctrl-c, initiating graceful shutdown");
        }

        token_clone.cancel();
    });

    token
}
