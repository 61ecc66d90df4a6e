//! Graceful Shutdown Handler
//!
//! Turns process signals into a cancellation of the running engine.

use crate::infrastructure::cancellation::CancelHandle;

/// Install signal handlers for graceful shutdown.
///
/// Completes when Ctrl+C or SIGTERM is received, after cancelling `handle`.
pub async fn shutdown_signal(handle: CancelHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
        _ = handle.cancelled() => {}
    }

    handle.cancel();
}
