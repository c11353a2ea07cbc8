//! Termination-signal handling.
//!
//! A signal never cancels a running command: the listener only raises a flag,
//! and the actuator checks it between steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shared "stop before the next step" flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has a stop been requested?
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Spawn a task that triggers the flag on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let flag = self.clone();
        tokio::spawn(async move {
            match wait_for_termination_signal().await {
                Ok(()) => {
                    warn!("Termination requested, stopping before the next step");
                    flag.trigger();
                }
                Err(e) => error!(error = %e, "Signal handler failed"),
            }
        })
    }
}

async fn wait_for_termination_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_is_shared_between_clones() {
        let flag = InterruptFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_triggered());

        flag.trigger();
        assert!(observer.is_triggered());
    }
}
