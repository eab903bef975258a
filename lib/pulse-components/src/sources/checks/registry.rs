use std::sync::Arc;

use pulse_error::{generic_error, GenericError};
use tracing::debug;

use super::{Check, HeartbeatCheck, InternalMetricsCheck};

/// The set of checks to schedule.
///
/// Built once during startup and handed to the [`Scheduler`](super::Scheduler).
#[derive(Clone, Default)]
pub struct CheckRegistry {
    checks: Vec<Arc<dyn Check>>,
}

impl CheckRegistry {
    /// Creates an empty `CheckRegistry`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a `CheckRegistry` holding the named built-in checks.
    ///
    /// # Errors
    ///
    /// If a name does not refer to a built-in check, or is listed twice, an error is returned.
    pub fn from_builtin_names<S: AsRef<str>>(names: &[S]) -> Result<Self, GenericError> {
        let mut registry = Self::new();

        for name in names {
            let check: Arc<dyn Check> = match name.as_ref() {
                HeartbeatCheck::NAME => Arc::new(HeartbeatCheck::new()),
                InternalMetricsCheck::NAME => Arc::new(InternalMetricsCheck),
                other => return Err(generic_error!("Unknown check '{}'.", other)),
            };
            registry.register(check)?;
        }

        Ok(registry)
    }

    /// Registers a check.
    ///
    /// # Errors
    ///
    /// If a check with the same identifier is already registered, an error is returned.
    pub fn register(&mut self, check: Arc<dyn Check>) -> Result<(), GenericError> {
        if self.checks.iter().any(|existing| existing.id() == check.id()) {
            return Err(generic_error!("Check '{}' is already registered.", check.id()));
        }

        debug!(check_id = check.id(), "Registered check.");
        self.checks.push(check);
        Ok(())
    }

    /// Returns the number of registered checks.
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Returns `true` if no checks are registered.
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Returns an iterator over the registered checks.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Check>> {
        self.checks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_builtin_checks() {
        let registry = CheckRegistry::from_builtin_names(&["heartbeat", "internal_metrics"]).unwrap();
        let ids = registry.iter().map(|c| c.id().to_string()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["heartbeat", "internal_metrics"]);
    }

    #[test]
    fn rejects_unknown_and_duplicate_checks() {
        let err = CheckRegistry::from_builtin_names(&["postgres"]).err().unwrap();
        assert!(err.to_string().contains("Unknown check 'postgres'"));

        let err = CheckRegistry::from_builtin_names(&["heartbeat", "heartbeat"]).err().unwrap();
        assert!(err.to_string().contains("already registered"));
    }
}
