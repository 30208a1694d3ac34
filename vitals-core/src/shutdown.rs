//! Graceful shutdown handling.
//!
//! Long-running tasks subscribe to a broadcast channel that fires once when
//! the process receives SIGINT, SIGTERM or SIGQUIT.

use tokio::sync::broadcast;
use tracing::info;

/// Create a shutdown signal channel. Every subsystem gets its own receiver
/// via `subscribe`.
pub fn shutdown_channel() -> broadcast::Sender<()> {
    let (tx, _rx) = broadcast::channel(1);

    let notify = tx.clone();
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let quit = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::quit()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGQUIT handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();
        #[cfg(not(unix))]
        let quit = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = terminate => info!("received SIGTERM"),
            _ = quit => info!("received SIGQUIT"),
        }

        let _ = notify.send(());
    });

    tx
}
