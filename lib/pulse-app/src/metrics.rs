//! Metrics.

use std::time::Duration;

use metrics::{gauge, Gauge};
use pulse_error::GenericError;
use tokio::{runtime::Handle, time::sleep};

/// Initializes internal telemetry.
///
/// The given prefix is prepended to every internal metric, followed by a period (e.g. `<prefix>.<metric name>`).
///
/// # Errors
///
/// If internal telemetry was already initialized, an error will be returned.
pub async fn initialize_metrics(metrics_prefix: impl Into<String>) -> Result<(), GenericError> {
    pulse_core::observability::metrics::initialize_metrics(metrics_prefix)?;

    // Runtime metrics are scraped for as long as the runtime lives.
    tokio::spawn(collect_runtime_metrics());

    Ok(())
}

async fn collect_runtime_metrics() {
    let handle = Handle::current();
    let runtime_metrics = RuntimeMetrics::new();

    loop {
        runtime_metrics.update(&handle.metrics());
        sleep(Duration::from_secs(5)).await;
    }
}

struct RuntimeMetrics {
    num_workers: Gauge,
    num_alive_tasks: Gauge,
}

impl RuntimeMetrics {
    fn new() -> Self {
        Self {
            num_workers: gauge!("runtime.num_workers"),
            num_alive_tasks: gauge!("runtime.num_alive_tasks"),
        }
    }

    fn update(&self, metrics: &tokio::runtime::RuntimeMetrics) {
        self.num_workers.set(metrics.num_workers() as f64);
        self.num_alive_tasks.set(metrics.num_alive_tasks() as f64);
    }
}
