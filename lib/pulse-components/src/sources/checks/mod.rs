//! Checks: periodically-sampled metric sources.

use std::time::Duration;

use pulse_config::GenericConfiguration;
use pulse_core::aggregate::AggregatorConfiguration;
use pulse_error::GenericError;
use serde::Deserialize;

mod check;
pub use self::check::{Check, SampleBatch};

mod heartbeat;
pub use self::heartbeat::HeartbeatCheck;

mod internal_metrics;
pub use self::internal_metrics::InternalMetricsCheck;

mod registry;
pub use self::registry::CheckRegistry;

mod scheduler;
pub use self::scheduler::Scheduler;

const fn default_check_interval_secs() -> u64 {
    30
}

fn default_checks() -> Vec<String> {
    vec![HeartbeatCheck::NAME.to_string(), InternalMetricsCheck::NAME.to_string()]
}

/// Checks configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ChecksConfiguration {
    /// How often every check is run, in seconds.
    ///
    /// A run that takes longer than this is considered timed out. Defaults to 30 seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Built-in checks to enable.
    ///
    /// Defaults to `heartbeat` and `internal_metrics`.
    #[serde(default = "default_checks")]
    pub checks: Vec<String>,

    /// Aggregation settings shared by every check.
    #[serde(flatten)]
    pub aggregator: AggregatorConfiguration,
}

impl ChecksConfiguration {
    /// Creates a new `ChecksConfiguration` from the given configuration.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Returns the check interval.
    ///
    /// Never zero, as a zero interval cannot be scheduled.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

impl Default for ChecksConfiguration {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            checks: default_checks(),
            aggregator: AggregatorConfiguration::default(),
        }
    }
}
