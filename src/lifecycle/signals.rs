//! OS signal handling.
//!
//! Ctrl-C and SIGTERM both start a graceful shutdown. A second signal
//! while draining exits immediately.

use std::io;

use super::Shutdown;

/// Wait for the next Ctrl-C or SIGTERM.
pub async fn wait_for_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Trigger `shutdown` on the first signal; exit the process on the second.
pub fn spawn_signal_handler(shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "Signal handler failed");
            return;
        }
        tracing::info!("Shutdown signal received");
        shutdown.trigger();

        if wait_for_signal().await.is_ok() {
            tracing::warn!("Second signal received, exiting without drain");
            std::process::exit(130);
        }
    })
}
