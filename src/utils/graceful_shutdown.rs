use std::time::Duration;

use eyre::{Result, WrapErr};
use tokio::{signal, sync::watch};

/// Why the gateway is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered programmatically
    Requested,
}

/// Fans a single shutdown signal out to every interested task.
///
/// The first trigger wins; later triggers are ignored. Waiters that subscribe after the
/// trigger still observe it.
pub struct GracefulShutdown {
    state: watch::Sender<Option<ShutdownReason>>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a manager with a 30-second drain timeout
    pub fn new() -> Self {
        Self::with_drain_timeout(Duration::from_secs(30))
    }

    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state,
            drain_timeout,
        }
    }

    /// How long in-flight requests may take to finish once shutdown starts.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Start shutdown. Returns `false` when it was already initiated.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let triggered = self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason);
            true
        });
        if triggered {
            tracing::info!(?reason, "Shutdown initiated");
        } else {
            tracing::debug!(?reason, "Shutdown already initiated, ignoring");
        }
        triggered
    }

    /// Listen for SIGINT and SIGTERM and trigger shutdown on the first one.
    pub async fn run_signal_handler(&self) -> Result<()> {
        #[cfg(unix)]
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to register SIGTERM handler")?;

        #[cfg(unix)]
        let terminate = async move {
            sigterm.recv().await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tracing::info!("Signal handler started. Listening for SIGINT and SIGTERM");

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for SIGINT")?;
                self.trigger(ShutdownReason::Interrupt);
            }
            _ = terminate => {
                self.trigger(ShutdownReason::Terminate);
            }
        }
        Ok(())
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) -> ShutdownReason {
        let mut receiver = self.state.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ShutdownReason::Requested),
            // The sender lives in `self`, so the channel cannot close while we wait
            Err(_) => ShutdownReason::Requested,
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}
