//! Signal handling for graceful shutdown
//!
//! The first SIGINT/SIGTERM cancels the run token so no further steps are
//! dispatched while running tool calls finish. A second signal exits.

use std::sync::Arc;
use tokio::sync::watch;

/// Exit status used when a second signal forces shutdown
const FORCED_EXIT_CODE: i32 = 130;

/// Cancellation token shared by the runner, its step tasks and the
/// signal handler
#[derive(Clone, Debug)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Create a new cancellation token
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Cancel the token
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Check if cancelled
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel `token` on the first signal and exit on the second
pub async fn setup_signal_handlers(token: CancellationToken) {
    if !wait_for_signal().await {
        return;
    }
    eprintln!("\nShutting down: waiting for running steps (signal again to force)...");
    tracing::warn!("shutdown requested, cancelling run");
    token.cancel();

    if wait_for_signal().await {
        eprintln!("\nForced shutdown");
        std::process::exit(FORCED_EXIT_CODE);
    }
}

/// Wait for SIGINT or SIGTERM; false if handlers could not be installed
#[cfg(unix)]
async fn wait_for_signal() -> bool {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "failed to install signal handlers");
            return false;
        }
    };

    tokio::select! {
        _ = sigint.recv() => tracing::debug!("received SIGINT"),
        _ = sigterm.recv() => tracing::debug!("received SIGTERM"),
    }
    true
}

#[cfg(not(unix))]
async fn wait_for_signal() -> bool {
    match tokio::signal::ctrl_c().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_cancel() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancellation_token_clone() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();

        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
    }
}
