use async_trait::async_trait;
use pulse_core::observability::metrics::collect_internal_metrics;
use pulse_error::GenericError;
use tokio_util::sync::CancellationToken;

use super::{Check, SampleBatch};

/// Internal metrics check.
///
/// Feeds the agent's own telemetry back through the pipeline. Counters are reported as raw readings and aggregated as
/// monotonic counts, so the collector sees per-interval deltas.
#[derive(Default)]
pub struct InternalMetricsCheck;

impl InternalMetricsCheck {
    /// Name of the check in the `checks` configuration list.
    pub const NAME: &'static str = "internal_metrics";
}

#[async_trait]
impl Check for InternalMetricsCheck {
    fn id(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, batch: &mut SampleBatch, _cancel: CancellationToken) -> Result<(), GenericError> {
        for metric in collect_internal_metrics() {
            batch.add(metric.metric_type, metric);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulse_core::{
        aggregate::{Aggregator, AggregatorConfiguration},
        metric::{Metric, MetricType},
        observability::metrics::initialize_metrics,
    };

    use super::*;

    const NAME: &str = "pulse.internal_metrics_check_total";

    async fn run_and_flush(check: &InternalMetricsCheck, aggregator: &mut Aggregator, now: i64) -> Vec<Metric> {
        let mut batch = SampleBatch::new();
        check.run(&mut batch, CancellationToken::new()).await.unwrap();
        assert_eq!(batch.apply(aggregator, now), 0);

        aggregator
            .flush(now)
            .into_iter()
            .filter(|metric| metric.name == NAME)
            .collect()
    }

    #[tokio::test]
    async fn counters_are_reported_as_interval_deltas() {
        // The recorder is process-wide, so it may already be installed.
        let _ = initialize_metrics("pulse");
        let counter = metrics::counter!("internal_metrics_check_total");

        let check = InternalMetricsCheck;
        let mut aggregator = Aggregator::new(AggregatorConfiguration::default(), Duration::from_secs(30));

        // The first reading only establishes a baseline.
        counter.increment(5);
        assert!(run_and_flush(&check, &mut aggregator, 1_000).await.is_empty());

        counter.increment(3);
        let flushed = run_and_flush(&check, &mut aggregator, 1_030).await;
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].metric_type, MetricType::Count);
        assert_eq!(flushed[0].value, Some(3.0));
    }
}
