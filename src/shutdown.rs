use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` cancelled when either signal arrives.
/// Every control loop selects on this token and drains before exiting; the
/// worker agent additionally deregisters from its pool.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!(signal = "SIGTERM", "Initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!(signal = "SIGINT", "Initiating graceful shutdown");
            }
        }

        trigger.cancel();
    });

    token
}
