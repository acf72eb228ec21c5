//! Shutdown signalling
//!
//! A `ShutdownController` flips a watch channel once; every cloned
//! `ShutdownSignal` observes it. `TerminationSignals` turns SIGTERM/SIGINT
//! into that one-shot trigger.

use tokio::sync::watch;
use tracing::info;

/// Receiving side of the shutdown channel
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait until shutdown is requested
    ///
    /// A dropped controller counts as a request, so waiters never hang on it.
    pub async fn wait(&mut self) {
        let _ = self.receiver.wait_for(|requested| *requested).await;
    }

    /// Check if shutdown was requested (non-blocking)
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Sending side of the shutdown channel
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    /// Request shutdown; repeated calls are no-ops
    pub fn shutdown(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    /// Another signal tied to this controller
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Create a new shutdown pair
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Registered OS termination signal handlers
///
/// Registering up front means a failure surfaces at startup, not when the
/// first signal arrives.
pub struct TerminationSignals {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    /// Register SIGTERM and SIGINT handlers
    #[cfg(unix)]
    pub fn register() -> Result<Self, std::io::Error> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Ctrl+C is handled lazily on non-unix targets
    #[cfg(not(unix))]
    pub fn register() -> Result<Self, std::io::Error> {
        Ok(Self {})
    }

    /// Wait for the next termination signal and return its name
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => {
                info!("Received SIGTERM");
                "SIGTERM"
            }
            _ = self.sigint.recv() => {
                info!("Received SIGINT");
                "SIGINT"
            }
        }
    }

    /// Wait for Ctrl+C (Windows)
    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to wait for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
        "CTRL_C"
    }
}
