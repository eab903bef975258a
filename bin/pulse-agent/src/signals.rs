use pulse_error::GenericError;
#[cfg(unix)]
use pulse_error::ErrorContext as _;
#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::warn;

/// What the process has been asked to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AgentSignal {
    /// Drain the pipeline and exit.
    Shutdown,

    /// Rebuild the pipeline from freshly loaded configuration.
    Reload,
}

/// Process signal listener.
///
/// SIGINT and SIGTERM request shutdown, and SIGHUP requests a reload. Only SIGINT is available on non-Unix platforms.
pub struct Signals {
    #[cfg(unix)]
    terminate: Signal,
    #[cfg(unix)]
    hangup: Signal,
}

impl Signals {
    /// Installs the signal handlers.
    ///
    /// # Errors
    ///
    /// If a handler cannot be installed, an error is returned.
    #[cfg(unix)]
    pub fn new() -> Result<Self, GenericError> {
        Ok(Self {
            terminate: signal(SignalKind::terminate()).error_context("Failed to install SIGTERM handler.")?,
            hangup: signal(SignalKind::hangup()).error_context("Failed to install SIGHUP handler.")?,
        })
    }

    /// Installs the signal handlers.
    #[cfg(not(unix))]
    pub fn new() -> Result<Self, GenericError> {
        Ok(Self {})
    }

    /// Waits for the next signal.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> AgentSignal {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for SIGINT. Shutting down.");
                }
                AgentSignal::Shutdown
            },
            _ = self.terminate.recv() => AgentSignal::Shutdown,
            _ = self.hangup.recv() => AgentSignal::Reload,
        }
    }

    /// Waits for the next signal.
    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> AgentSignal {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for interrupt. Shutting down.");
        }
        AgentSignal::Shutdown
    }
}
