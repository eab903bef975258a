//! Per-context metric aggregation.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use hashbrown::hash_map::Entry;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::{
    metric::{Metric, MetricType, SampleError},
    FastHashMap,
};

mod generator;
pub use self::generator::{sample_weight, Generator};

mod histogram;
pub use self::histogram::{HistogramAggregate, HistogramConfiguration};

const fn default_expiry_secs() -> u64 {
    300
}

/// Aggregator configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AggregatorConfiguration {
    /// How long a context may go without samples before it is removed, in seconds.
    ///
    /// Defaults to 300 seconds.
    #[serde(rename = "aggregator_expiry_secs", default = "default_expiry_secs")]
    pub expiry_secs: u64,

    /// Histogram aggregates and percentiles.
    #[serde(flatten)]
    pub histogram: HistogramConfiguration,
}

impl Default for AggregatorConfiguration {
    fn default() -> Self {
        Self {
            expiry_secs: default_expiry_secs(),
            histogram: HistogramConfiguration::default(),
        }
    }
}

/// Aggregates samples by context.
///
/// Each context lazily gets a [`Generator`] matching the type of its first sample. Generators live until they go
/// longer than the expiry window without a sample, at which point the next flush removes them without emitting
/// anything.
///
/// An `Aggregator` is owned by a single task; output is handed off as fully-formed [`Metric`] values.
#[derive(Debug)]
pub struct Aggregator {
    config: AggregatorConfiguration,
    interval_secs: f64,
    generators: FastHashMap<crate::metric::Context, Generator>,
}

impl Aggregator {
    /// Creates a new `Aggregator` that is flushed every `interval`.
    ///
    /// The interval is used to turn histogram counts into per-second rates.
    pub fn new(config: AggregatorConfiguration, interval: Duration) -> Self {
        let interval_secs = interval.as_secs_f64();

        Self {
            config,
            interval_secs: if interval_secs > 0.0 { interval_secs } else { 1.0 },
            generators: FastHashMap::default(),
        }
    }

    /// Returns the number of tracked contexts.
    pub fn context_count(&self) -> usize {
        self.generators.len()
    }

    /// Adds a sample for the given metric type.
    ///
    /// The metric's own `metric_type` is ignored in favor of `metric_type`. If the context already has a generator,
    /// the existing generator is used regardless of type.
    ///
    /// # Errors
    ///
    /// If the value is missing or non-finite, or would make an accumulated total non-finite, the sample is dropped and
    /// an error is returned. Aggregation state is left untouched.
    pub fn add(&mut self, metric_type: MetricType, metric: Metric, now: i64) -> Result<(), SampleError> {
        let value = metric.validated_value()?;
        let context = metric.context();

        match self.generators.entry(context) {
            Entry::Occupied(entry) => {
                entry
                    .into_mut()
                    .sample(&metric.name, value, metric.sample_rate, metric.timestamp, now)
            }
            Entry::Vacant(entry) => {
                // A context is only tracked once its first sample has been accepted.
                let mut generator = Generator::new(metric_type, now);
                generator.sample(&metric.name, value, metric.sample_rate, metric.timestamp, now)?;

                trace!(context = %entry.key(), %metric_type, "Tracking new context.");
                entry.insert(generator);
                Ok(())
            }
        }
    }

    /// Adds one sample per field, named `<prefix>.<field>`.
    ///
    /// Does nothing if `prefix` or `fields` is empty. Every field shares the given tags, device name, and timestamp.
    ///
    /// # Errors
    ///
    /// Every field is attempted. If any field is rejected, the first error is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn add_metrics(
        &mut self, metric_type: MetricType, prefix: &str, fields: &BTreeMap<String, f64>, tags: &BTreeSet<String>,
        device_name: &str, timestamp: Option<i64>, now: i64,
    ) -> Result<(), SampleError> {
        if prefix.is_empty() || fields.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        for (field, value) in fields {
            let metric = Metric::new(format!("{}.{}", prefix, field), metric_type)
                .with_value(*value)
                .with_tags(tags.iter().cloned())
                .with_device_name(device_name)
                .with_timestamp(timestamp);

            if let Err(e) = self.add(metric_type, metric, now) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flushes every tracked context.
    ///
    /// Contexts that have not been sampled for longer than the expiry window are removed instead of flushed.
    pub fn flush(&mut self, now: i64) -> Vec<Metric> {
        let expiry_secs = self.config.expiry_secs as i64;
        let mut flushed = Vec::new();
        let mut expired = 0;

        self.generators.retain(|context, generator| {
            if now - generator.last_sample_time() > expiry_secs {
                trace!(%context, "Context expired.");
                expired += 1;
                return false;
            }

            generator.flush(context, &self.config.histogram, now, self.interval_secs, &mut flushed);
            true
        });

        if expired > 0 {
            debug!(expired, remaining = self.generators.len(), "Removed expired contexts.");
        }

        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn aggregator() -> Aggregator {
        Aggregator::new(AggregatorConfiguration::default(), Duration::from_secs(10))
    }

    fn counter(name: &str, value: f64) -> Metric {
        Metric::new(name, MetricType::Counter).with_value(value)
    }

    #[test]
    fn equivalent_tags_share_generator() {
        let mut aggregator = aggregator();
        aggregator
            .add(MetricType::Counter, counter("requests", 1.0).with_tags(["a", "b"]), NOW)
            .unwrap();
        aggregator
            .add(MetricType::Counter, counter("requests", 2.0).with_tags(["b", "a", "a"]), NOW)
            .unwrap();

        assert_eq!(aggregator.context_count(), 1);

        let flushed = aggregator.flush(NOW);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].value, Some(3.0));
        assert_eq!(flushed[0].tags, BTreeSet::from(["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn invalid_values_leave_state_untouched() {
        let mut aggregator = aggregator();
        assert!(aggregator
            .add(MetricType::Gauge, Metric::new("cpu", MetricType::Gauge), NOW)
            .is_err());
        assert!(aggregator
            .add(MetricType::Gauge, Metric::new("cpu", MetricType::Gauge).with_value(f64::NAN), NOW)
            .is_err());
        assert_eq!(aggregator.context_count(), 0);

        aggregator
            .add(MetricType::Gauge, Metric::new("cpu", MetricType::Gauge).with_value(0.5), NOW)
            .unwrap();
        assert!(aggregator
            .add(MetricType::Gauge, Metric::new("cpu", MetricType::Gauge).with_value(f64::INFINITY), NOW)
            .is_err());

        let flushed = aggregator.flush(NOW);
        assert_eq!(flushed[0].value, Some(0.5));
    }

    #[test]
    fn overflowing_first_sample_does_not_track_context() {
        let mut aggregator = aggregator();
        let huge = counter("huge", 1e308).with_sample_rate(0.1);

        assert!(matches!(
            aggregator.add(MetricType::Counter, huge, NOW),
            Err(SampleError::NonFiniteValue { .. })
        ));
        assert_eq!(aggregator.context_count(), 0);
        assert!(aggregator.flush(NOW).is_empty());

        // An existing context keeps its total when a later sample overflows.
        aggregator.add(MetricType::Counter, counter("huge", 5.0), NOW).unwrap();
        let overflow = counter("huge", 1e308).with_sample_rate(0.1);
        assert!(aggregator.add(MetricType::Counter, overflow, NOW).is_err());
        assert_eq!(aggregator.context_count(), 1);
        assert_eq!(aggregator.flush(NOW)[0].value, Some(5.0));
    }

    #[test]
    fn add_metrics_fans_out() {
        let mut aggregator = aggregator();
        let fields = BTreeMap::from([("reads".to_string(), 10.0), ("writes".to_string(), 4.0)]);
        let tags = BTreeSet::from(["disk:sda".to_string()]);

        aggregator
            .add_metrics(MetricType::Gauge, "io", &fields, &tags, "sda", Some(NOW - 5), NOW)
            .unwrap();

        let mut flushed = aggregator.flush(NOW);
        flushed.sort_by(|a, b| a.name.cmp(&b.name));

        let summary = flushed
            .iter()
            .map(|m| (m.name.as_str(), m.value, m.device_name.as_str(), m.timestamp))
            .collect::<Vec<_>>();
        similar_asserts::assert_eq!(
            summary,
            vec![
                ("io.reads", Some(10.0), "sda", Some(NOW - 5)),
                ("io.writes", Some(4.0), "sda", Some(NOW - 5)),
            ]
        );
        assert!(flushed.iter().all(|m| m.tags == tags));
    }

    #[test]
    fn add_metrics_ignores_empty_input() {
        let mut aggregator = aggregator();
        let fields = BTreeMap::from([("reads".to_string(), 10.0)]);

        aggregator
            .add_metrics(MetricType::Gauge, "", &fields, &BTreeSet::new(), "", None, NOW)
            .unwrap();
        aggregator
            .add_metrics(MetricType::Gauge, "io", &BTreeMap::new(), &BTreeSet::new(), "", None, NOW)
            .unwrap();

        assert_eq!(aggregator.context_count(), 0);
    }

    #[test]
    fn expired_contexts_removed_silently() {
        let mut aggregator = aggregator();
        aggregator
            .add(MetricType::Counter, counter("requests", 1.0), NOW)
            .unwrap();

        // Exactly at the expiry boundary the context is still flushed.
        assert_eq!(aggregator.flush(NOW + 300).len(), 1);

        assert!(aggregator.flush(NOW + 301).is_empty());
        assert_eq!(aggregator.context_count(), 0);
    }

    #[test]
    fn resampled_context_survives_expiry() {
        let mut aggregator = aggregator();
        aggregator
            .add(MetricType::Counter, counter("requests", 1.0), NOW)
            .unwrap();
        aggregator
            .add(MetricType::Counter, counter("requests", 1.0), NOW + 200)
            .unwrap();

        let flushed = aggregator.flush(NOW + 400);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].last_sample_time, NOW + 200);
    }

    #[test]
    fn existing_generator_type_wins() {
        let mut aggregator = aggregator();
        aggregator
            .add(MetricType::Counter, counter("requests", 1.0), NOW)
            .unwrap();
        aggregator
            .add(MetricType::Gauge, counter("requests", 5.0), NOW)
            .unwrap();

        let flushed = aggregator.flush(NOW);
        assert_eq!(flushed[0].value, Some(6.0));
        assert_eq!(flushed[0].metric_type, MetricType::Counter);
    }

    #[test]
    fn histogram_count_uses_flush_interval() {
        let mut aggregator = Aggregator::new(AggregatorConfiguration::default(), Duration::from_secs(1));
        for _ in 0..4000 {
            aggregator
                .add(
                    MetricType::Histogram,
                    Metric::new("latency", MetricType::Histogram).with_value(1.0),
                    NOW,
                )
                .unwrap();
        }

        let flushed = aggregator.flush(NOW);
        let count = flushed.iter().find(|m| m.name == "latency.count").unwrap();
        assert_eq!(count.value, Some(4000.0));
    }

    #[test]
    fn configuration_defaults() {
        let config: AggregatorConfiguration = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AggregatorConfiguration::default());

        let config: AggregatorConfiguration =
            serde_json::from_str(r#"{"histogram_aggregates": ["min"], "histogram_percentiles": [0.5, 0.99]}"#)
                .unwrap();
        assert_eq!(config.histogram.aggregates, vec![HistogramAggregate::Min]);
        assert_eq!(config.histogram.percentiles, vec![0.5, 0.99]);
    }
}
