//! Graceful shutdown signal handling.
//!
//! Listens for the platform's termination signals and hands back a channel
//! receiver that fires once when shutdown is requested.

use tokio::sync::oneshot;
use tracing::info;

/// Sets up the signal handler task and returns the receiver it triggers.
///
/// Unix listens for SIGINT and SIGTERM; Windows for Ctrl+C.
pub fn setup_shutdown_handler() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
                return;
            };
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                return;
            };

            tokio::select! {
                _ = sigint.recv() => {
                    info!("SIGINT received - initiating graceful shutdown");
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received - initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received - initiating graceful shutdown");
            }
        }

        let _ = tx.send(());
    });

    rx
}
