// src/shutdown.rs
use crate::Result;
use std::{future::Future, time::Duration};
use tracing::info;

/// Anything that can be asked to stop within a deadline.
///
/// The shutdown path depends only on this, never on a concrete pool or store.
#[async_trait::async_trait]
pub trait Stoppable: Send + Sync {
    async fn stop(&self, deadline: Duration) -> Result<()>;
}

/// Resolve once SIGTERM or SIGINT (or Ctrl+C off unix) arrives.
pub async fn wait_for_signal() -> Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = sigint.recv() => info!("SIGINT received"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("CTRL+C received");
    }

    Ok(())
}

/// Wait for `signal`, then stop `target`, giving it `grace` to drain.
pub async fn shutdown_handler<F>(signal: F, target: &dyn Stoppable, grace: Duration) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    signal.await?;
    info!(grace_secs = grace.as_secs(), "shutting down");

    target.stop(grace).await?;
    info!("stopped gracefully");
    Ok(())
}
