use async_trait::async_trait;
use pulse_core::metric::{Metric, MetricType};
use pulse_error::GenericError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Check, SampleBatch};

/// Heartbeat check.
///
/// Emits `pulse.agent.running` and `pulse.agent.uptime` on every run so the collector can tell the agent is alive.
pub struct HeartbeatCheck {
    started: Instant,
}

impl HeartbeatCheck {
    /// Name of the check in the `checks` configuration list.
    pub const NAME: &'static str = "heartbeat";

    /// Creates a new `HeartbeatCheck` whose uptime is measured from now.
    pub fn new() -> Self {
        Self { started: Instant::now() }
    }
}

impl Default for HeartbeatCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Check for HeartbeatCheck {
    fn id(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, batch: &mut SampleBatch, _cancel: CancellationToken) -> Result<(), GenericError> {
        let uptime = self.started.elapsed().as_secs_f64();

        batch.add(
            MetricType::Gauge,
            Metric::new("pulse.agent.running", MetricType::Gauge).with_value(1.0),
        );
        batch.add(
            MetricType::Gauge,
            Metric::new("pulse.agent.uptime", MetricType::Gauge).with_value(uptime.floor()),
        );

        Ok(())
    }
}
