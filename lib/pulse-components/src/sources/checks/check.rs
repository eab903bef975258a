use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use pulse_core::{
    aggregate::Aggregator,
    metric::{Metric, MetricType},
};
use pulse_error::GenericError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A check.
///
/// Checks are sampling sources: each run samples whatever the check observes and records it into a [`SampleBatch`].
/// The scheduler owns aggregation, so a check never touches aggregation state directly.
#[async_trait]
pub trait Check: Send + Sync {
    /// Gets the identifier of the check.
    ///
    /// This is used to uniquely identify check instances.
    fn id(&self) -> &str;

    /// Runs the check once.
    ///
    /// `cancel` is triggered if the run outlives its interval or the process is shutting down. Checks are not required
    /// to observe it, but long-running checks should stop early when it fires.
    ///
    /// # Errors
    ///
    /// If a problem occurs while running the check, an error is returned and anything recorded in `batch` is
    /// discarded.
    async fn run(&self, batch: &mut SampleBatch, cancel: CancellationToken) -> Result<(), GenericError>;
}

#[derive(Debug)]
enum Sample {
    Single {
        metric_type: MetricType,
        metric: Metric,
    },
    Fields {
        metric_type: MetricType,
        prefix: String,
        fields: BTreeMap<String, f64>,
        tags: BTreeSet<String>,
        device_name: String,
        timestamp: Option<i64>,
    },
}

/// Samples recorded by a single check run.
///
/// Samples are replayed, in order, into the check's aggregator once the run completes.
#[derive(Debug, Default)]
pub struct SampleBatch {
    samples: Vec<Sample>,
}

impl SampleBatch {
    /// Creates an empty `SampleBatch`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a single sample of the given type.
    pub fn add(&mut self, metric_type: MetricType, metric: Metric) {
        self.samples.push(Sample::Single { metric_type, metric });
    }

    /// Records one sample per field, named `<prefix>.<field>`.
    pub fn add_metrics<P, D>(
        &mut self, metric_type: MetricType, prefix: P, fields: BTreeMap<String, f64>, tags: BTreeSet<String>,
        device_name: D, timestamp: Option<i64>,
    ) where
        P: Into<String>,
        D: Into<String>,
    {
        self.samples.push(Sample::Fields {
            metric_type,
            prefix: prefix.into(),
            fields,
            tags,
            device_name: device_name.into(),
            timestamp,
        });
    }

    /// Returns the number of recorded operations.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Replays every recorded sample into `aggregator`.
    ///
    /// Invalid samples are logged and skipped. Returns the number of operations that were rejected.
    pub fn apply(self, aggregator: &mut Aggregator, now: i64) -> usize {
        let mut rejected = 0;

        for sample in self.samples {
            let result = match sample {
                Sample::Single { metric_type, metric } => aggregator.add(metric_type, metric, now),
                Sample::Fields {
                    metric_type,
                    prefix,
                    fields,
                    tags,
                    device_name,
                    timestamp,
                } => aggregator.add_metrics(metric_type, &prefix, &fields, &tags, &device_name, timestamp, now),
            };

            if let Err(e) = result {
                warn!(error = %e, "Dropped invalid sample.");
                rejected += 1;
            }
        }

        rejected
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulse_core::aggregate::AggregatorConfiguration;

    use super::*;

    #[test]
    fn apply_replays_in_order_and_skips_invalid() {
        let mut aggregator = Aggregator::new(AggregatorConfiguration::default(), Duration::from_secs(30));

        let mut batch = SampleBatch::new();
        batch.add(MetricType::Gauge, Metric::new("load", MetricType::Gauge).with_value(1.0));
        batch.add(MetricType::Gauge, Metric::new("load", MetricType::Gauge).with_value(2.0));
        batch.add(MetricType::Gauge, Metric::new("broken", MetricType::Gauge).with_value(f64::NAN));

        let fields = BTreeMap::from([("reads".to_string(), 3.0), ("writes".to_string(), 4.0)]);
        batch.add_metrics(MetricType::Gauge, "disk", fields, BTreeSet::new(), "sda", None);
        assert_eq!(batch.len(), 4);

        assert_eq!(batch.apply(&mut aggregator, 100), 1);
        assert_eq!(aggregator.context_count(), 3);

        let mut flushed = aggregator.flush(100);
        flushed.sort_by(|a, b| a.name.cmp(&b.name));

        let names = flushed.iter().map(|m| m.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["disk.reads", "disk.writes", "load"]);
        assert_eq!(flushed[0].device_name, "sda");
        assert_eq!(flushed[2].value, Some(2.0));
    }
}
