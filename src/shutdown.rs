use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Turns the first SIGTERM or SIGINT into a cancelled token.
///
/// `serve` hands the token to the HTTP server's graceful shutdown. Once
/// in-flight requests finish, the job store is closed, which drains the
/// SQLite connection pool.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}
