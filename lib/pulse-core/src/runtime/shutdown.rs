use tokio_util::sync::CancellationToken;

/// Broadcasts a single shutdown signal to every registered task.
///
/// Triggering shutdown is idempotent, and signals registered after shutdown has been triggered resolve immediately.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Creates a new `ShutdownCoordinator`.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Registers a new shutdown signal.
    pub fn register(&self) -> ShutdownSignal {
        ShutdownSignal {
            token: self.token.child_token(),
        }
    }

    /// Triggers shutdown for every registered signal.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Returns `true` if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// A shutdown signal for a single task.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Creates a `ShutdownSignal` that never fires.
    ///
    /// Useful where a signal is required but no shutdown is expected, such as in tests.
    pub fn noop() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Waits for shutdown to be triggered.
    ///
    /// Returns immediately if shutdown was already triggered. Safe to use as a `select!` branch.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Creates a cancellation token that fires on shutdown, and can also be cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Returns `true` if shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}
