use ordered_float::OrderedFloat;
use tracing::{debug, warn};

use super::histogram::{Histogram, HistogramConfiguration};
use crate::{
    metric::{Context, Metric, MetricType, SampleError},
    FastHashSet,
};

/// Converts a sample rate into the number of events a single sample stands for.
///
/// Rates outside of `(0, 1]` are treated as unsampled.
pub fn sample_weight(sample_rate: f64) -> u64 {
    if sample_rate.is_finite() && sample_rate > 0.0 && sample_rate <= 1.0 {
        (1.0 / sample_rate).round().max(1.0) as u64
    } else {
        1
    }
}

#[derive(Debug, Default)]
struct Gauge {
    value: Option<f64>,
    timestamp: Option<i64>,
}

#[derive(Debug, Default)]
struct Counter {
    total: f64,
    sampled: bool,
}

#[derive(Debug, Default)]
struct Rate {
    previous: Option<(i64, f64)>,
    current: Option<(i64, f64)>,
}

#[derive(Debug, Default)]
struct MonotonicCount {
    previous: Option<f64>,
    readings: u64,
    delta: f64,
}

#[derive(Debug)]
enum State {
    Gauge(Gauge),
    BucketGauge(Gauge),
    Counter(Counter),
    Rate(Rate),
    Count(Counter),
    MonotonicCount(MonotonicCount),
    Set(FastHashSet<OrderedFloat<f64>>),
    Histogram(Histogram),
}

/// Aggregation state for a single context.
///
/// Holds the per-type accumulation state along with the time of the most recent sample, which drives expiry.
#[derive(Debug)]
pub struct Generator {
    state: State,
    last_sample_time: i64,
}

impl Generator {
    /// Creates a new, empty `Generator` for the given metric type.
    pub fn new(metric_type: MetricType, now: i64) -> Self {
        let state = match metric_type {
            MetricType::Gauge => State::Gauge(Gauge::default()),
            MetricType::BucketGauge => State::BucketGauge(Gauge::default()),
            MetricType::Counter => State::Counter(Counter::default()),
            MetricType::Rate => State::Rate(Rate::default()),
            MetricType::Count => State::Count(Counter::default()),
            MetricType::MonotonicCount => State::MonotonicCount(MonotonicCount::default()),
            MetricType::Set => State::Set(FastHashSet::default()),
            MetricType::Histogram => State::Histogram(Histogram::default()),
        };

        Self {
            state,
            last_sample_time: now,
        }
    }

    /// Returns the time of the most recent sample, in seconds since the Unix epoch.
    pub fn last_sample_time(&self) -> i64 {
        self.last_sample_time
    }

    /// Applies a sample.
    ///
    /// `timestamp` is the explicit sample time, if any. `now` is the wall clock time at which the sample was received.
    ///
    /// # Errors
    ///
    /// If applying the sample would make an accumulated total non-finite, the sample is discarded and an error is
    /// returned.
    pub fn sample(
        &mut self, name: &str, value: f64, sample_rate: f64, timestamp: Option<i64>, now: i64,
    ) -> Result<(), SampleError> {
        let weight = sample_weight(sample_rate);

        match &mut self.state {
            State::Gauge(gauge) | State::BucketGauge(gauge) => {
                gauge.value = Some(value);
                gauge.timestamp = timestamp;
            }
            State::Counter(counter) | State::Count(counter) => {
                let total = if counter.sampled {
                    counter.total + value * weight as f64
                } else {
                    value * weight as f64
                };
                if !total.is_finite() {
                    return Err(SampleError::NonFiniteValue {
                        name: name.to_string(),
                        value: total,
                    });
                }
                counter.total = total;
                counter.sampled = true;
            }
            State::Rate(rate) => {
                rate.previous = rate.current.take();
                rate.current = Some((timestamp.unwrap_or(now), value));
            }
            State::MonotonicCount(mc) => {
                if let Some(previous) = mc.previous {
                    mc.delta += (value - previous).max(0.0);
                }
                mc.previous = Some(value);
                mc.readings = mc.readings.saturating_add(1);
            }
            State::Set(values) => {
                values.insert(OrderedFloat(value));
            }
            State::Histogram(histogram) => histogram.sample(value, weight),
        }

        self.last_sample_time = now;
        Ok(())
    }

    /// Drains accumulated state into `out`.
    ///
    /// `now` is stamped on every emitted metric unless a gauge sample carried an explicit timestamp. `interval_secs` is
    /// the length of the flush interval and is only used to turn histogram counts into rates.
    pub fn flush(
        &mut self, context: &Context, histogram_config: &HistogramConfiguration, now: i64, interval_secs: f64,
        out: &mut Vec<Metric>,
    ) {
        let first_flushed = out.len();
        match &mut self.state {
            State::Gauge(gauge) | State::BucketGauge(gauge) => {
                if let Some(value) = gauge.value.take() {
                    let timestamp = gauge.timestamp.take().unwrap_or(now);
                    out.push(flushed_metric(
                        context,
                        context.name().to_string(),
                        value,
                        MetricType::Gauge,
                        timestamp,
                    ));
                }
            }
            State::Counter(counter) => {
                let total = std::mem::take(&mut counter.total);
                counter.sampled = false;
                out.push(flushed_metric(
                    context,
                    context.name().to_string(),
                    total,
                    MetricType::Counter,
                    now,
                ));
            }
            State::Rate(rate) => {
                let (Some((prev_time, prev_value)), Some((cur_time, cur_value))) = (rate.previous.take(), rate.current)
                else {
                    return;
                };

                let duration = cur_time - prev_time;
                let delta = cur_value - prev_value;
                if duration == 0 {
                    debug!(context = %context, "Rate samples have identical timestamps. Skipping.");
                } else if delta < 0.0 {
                    debug!(context = %context, "Rate value decreased; assuming counter reset. Skipping.");
                } else {
                    out.push(flushed_metric(
                        context,
                        context.name().to_string(),
                        delta / duration as f64,
                        MetricType::Gauge,
                        now,
                    ));
                }
            }
            State::Count(count) => {
                if count.sampled {
                    let total = std::mem::take(&mut count.total);
                    count.sampled = false;
                    out.push(flushed_metric(
                        context,
                        context.name().to_string(),
                        total,
                        MetricType::Count,
                        now,
                    ));
                }
            }
            State::MonotonicCount(mc) => {
                if mc.readings >= 2 {
                    let delta = std::mem::take(&mut mc.delta);
                    out.push(flushed_metric(
                        context,
                        context.name().to_string(),
                        delta,
                        MetricType::Count,
                        now,
                    ));
                }
            }
            State::Set(values) => {
                if !values.is_empty() {
                    let cardinality = values.len() as f64;
                    values.clear();
                    out.push(flushed_metric(
                        context,
                        context.name().to_string(),
                        cardinality,
                        MetricType::Gauge,
                        now,
                    ));
                }
            }
            State::Histogram(histogram) => histogram.flush(context, histogram_config, now, interval_secs, out),
        }

        let mut flushed = out.split_off(first_flushed);
        flushed.retain(|metric| match metric.value {
            Some(value) if !value.is_finite() => {
                warn!(context = %context, metric = %metric.name, value, "Flushed value is not finite. Dropping.");
                false
            }
            _ => true,
        });
        for metric in &mut flushed {
            metric.last_sample_time = self.last_sample_time;
        }
        out.append(&mut flushed);
    }
}

pub(super) fn flushed_metric(
    context: &Context, name: String, value: f64, metric_type: MetricType, timestamp: i64,
) -> Metric {
    Metric {
        name,
        value: Some(value),
        tags: context.tags().iter().cloned().collect(),
        hostname: context.hostname().to_string(),
        device_name: context.device_name().to_string(),
        timestamp: Some(timestamp),
        last_sample_time: timestamp,
        metric_type,
        sample_rate: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn context() -> Context {
        Context::new("test.metric", ["env:test"], "host-a", "")
    }

    fn flush(generator: &mut Generator, now: i64) -> Vec<Metric> {
        flush_with(generator, &HistogramConfiguration::default(), now, 10.0)
    }

    fn flush_with(
        generator: &mut Generator, config: &HistogramConfiguration, now: i64, interval_secs: f64,
    ) -> Vec<Metric> {
        let mut out = Vec::new();
        generator.flush(&context(), config, now, interval_secs, &mut out);
        out
    }

    fn values(metrics: &[Metric]) -> Vec<f64> {
        metrics.iter().filter_map(|m| m.value).collect()
    }

    fn sample(generator: &mut Generator, value: f64, now: i64) {
        generator.sample("test.metric", value, 1.0, None, now).unwrap();
    }

    #[test]
    fn weights() {
        assert_eq!(sample_weight(1.0), 1);
        assert_eq!(sample_weight(0.5), 2);
        assert_eq!(sample_weight(0.1), 10);
        assert_eq!(sample_weight(0.3), 3);
        assert_eq!(sample_weight(0.0), 1);
        assert_eq!(sample_weight(-1.0), 1);
        assert_eq!(sample_weight(f64::NAN), 1);
        assert_eq!(sample_weight(4.0), 1);
    }

    #[test]
    fn gauge_last_write_wins() {
        let mut generator = Generator::new(MetricType::Gauge, NOW);
        sample(&mut generator, 1.0, NOW);
        sample(&mut generator, 7.0, NOW);

        let flushed = flush(&mut generator, NOW + 10);
        assert_eq!(values(&flushed), vec![7.0]);
        assert_eq!(flushed[0].timestamp, Some(NOW + 10));
        assert_eq!(flushed[0].metric_type, MetricType::Gauge);

        assert!(flush(&mut generator, NOW + 20).is_empty());
    }

    #[test]
    fn gauge_explicit_timestamp_passes_through() {
        let mut generator = Generator::new(MetricType::Gauge, NOW);
        generator.sample("test.metric", 3.0, 1.0, Some(NOW - 60), NOW).unwrap();

        let flushed = flush(&mut generator, NOW + 10);
        assert_eq!(flushed[0].timestamp, Some(NOW - 60));
    }

    #[test]
    fn bucket_gauge_emits_gauge() {
        let mut generator = Generator::new(MetricType::BucketGauge, NOW);
        sample(&mut generator, 2.0, NOW);

        let flushed = flush(&mut generator, NOW);
        assert_eq!(values(&flushed), vec![2.0]);
        assert_eq!(flushed[0].metric_type, MetricType::Gauge);
    }

    #[test]
    fn counter_always_emits() {
        let mut generator = Generator::new(MetricType::Counter, NOW);
        for value in [1.0, 4.0, 15.0] {
            sample(&mut generator, value, NOW);
        }

        let flushed = flush(&mut generator, NOW);
        assert_eq!(values(&flushed), vec![20.0]);
        assert_eq!(flushed[0].metric_type, MetricType::Counter);

        assert_eq!(values(&flush(&mut generator, NOW + 10)), vec![0.0]);
    }

    #[test]
    fn counter_corrects_for_sample_rate() {
        let mut generator = Generator::new(MetricType::Counter, NOW);
        generator.sample("test.metric", 1.0, 0.5, None, NOW).unwrap();
        generator.sample("test.metric", 1.0, 0.1, None, NOW).unwrap();

        assert_eq!(values(&flush(&mut generator, NOW)), vec![12.0]);
    }

    #[test]
    fn counter_rejects_overflow() {
        let mut generator = Generator::new(MetricType::Counter, NOW);
        sample(&mut generator, f64::MAX, NOW);
        assert!(generator.sample("test.metric", f64::MAX, 1.0, None, NOW).is_err());

        assert_eq!(values(&flush(&mut generator, NOW)), vec![f64::MAX]);
    }

    #[test]
    fn rate_requires_two_samples() {
        let mut generator = Generator::new(MetricType::Rate, NOW);
        sample(&mut generator, 10.0, NOW);
        assert!(flush(&mut generator, NOW).is_empty());

        sample(&mut generator, 40.0, NOW + 1);
        let flushed = flush(&mut generator, NOW + 1);
        assert_eq!(values(&flushed), vec![30.0]);
        assert_eq!(flushed[0].metric_type, MetricType::Gauge);

        // The pair is consumed by the flush.
        assert!(flush(&mut generator, NOW + 2).is_empty());

        // The last sample becomes the base for the next pair.
        sample(&mut generator, 50.0, NOW + 3);
        assert_eq!(values(&flush(&mut generator, NOW + 3)), vec![5.0]);
    }

    #[test]
    fn rate_skips_decrease() {
        let mut generator = Generator::new(MetricType::Rate, NOW);
        sample(&mut generator, 10.0, NOW);
        sample(&mut generator, 9.0, NOW + 1);

        assert!(flush(&mut generator, NOW + 1).is_empty());
    }

    #[test]
    fn rate_skips_zero_duration() {
        let mut generator = Generator::new(MetricType::Rate, NOW);
        sample(&mut generator, 10.0, NOW);
        sample(&mut generator, 20.0, NOW);

        assert!(flush(&mut generator, NOW).is_empty());
    }

    #[test]
    fn rate_uses_explicit_timestamps() {
        let mut generator = Generator::new(MetricType::Rate, NOW);
        generator.sample("test.metric", 0.0, 1.0, Some(NOW - 10), NOW).unwrap();
        generator.sample("test.metric", 100.0, 1.0, Some(NOW), NOW).unwrap();

        assert_eq!(values(&flush(&mut generator, NOW)), vec![10.0]);
    }

    #[test]
    fn count_is_lazy() {
        let mut generator = Generator::new(MetricType::Count, NOW);
        assert!(flush(&mut generator, NOW).is_empty());

        sample(&mut generator, 3.0, NOW);
        sample(&mut generator, 4.0, NOW);
        let flushed = flush(&mut generator, NOW);
        assert_eq!(values(&flushed), vec![7.0]);
        assert_eq!(flushed[0].metric_type, MetricType::Count);

        assert!(flush(&mut generator, NOW + 10).is_empty());
    }

    #[test]
    fn monotonic_count_suppresses_first_reading() {
        let mut generator = Generator::new(MetricType::MonotonicCount, NOW);
        sample(&mut generator, 5.0, NOW);
        assert!(flush(&mut generator, NOW).is_empty());

        sample(&mut generator, 8.0, NOW + 10);
        assert_eq!(values(&flush(&mut generator, NOW + 10)), vec![3.0]);
    }

    #[test]
    fn monotonic_count_ignores_resets_and_keeps_memory() {
        let mut generator = Generator::new(MetricType::MonotonicCount, NOW);
        for value in [5.0, 8.0, 2.0, 6.0] {
            sample(&mut generator, value, NOW);
        }
        assert_eq!(values(&flush(&mut generator, NOW)), vec![7.0]);

        // No new readings: the accumulated delta has been reset but the generator still emits.
        assert_eq!(values(&flush(&mut generator, NOW + 10)), vec![0.0]);

        sample(&mut generator, 10.0, NOW + 20);
        assert_eq!(values(&flush(&mut generator, NOW + 20)), vec![4.0]);
    }

    #[test]
    fn monotonic_count_drops_overflowing_delta() {
        let mut generator = Generator::new(MetricType::MonotonicCount, NOW);
        for value in [0.0, 1.7e308, 0.0, 1.7e308] {
            sample(&mut generator, value, NOW);
        }
        assert!(flush(&mut generator, NOW).is_empty());

        // The accumulated delta is reset even though nothing was emitted.
        sample(&mut generator, 1.7e308, NOW + 10);
        assert_eq!(values(&flush(&mut generator, NOW + 10)), vec![0.0]);
    }

    #[test]
    fn rate_drops_overflowing_delta() {
        let mut generator = Generator::new(MetricType::Rate, NOW);
        sample(&mut generator, -1.7e308, NOW);
        sample(&mut generator, 1.7e308, NOW + 1);
        assert!(flush(&mut generator, NOW + 1).is_empty());
    }

    #[test]
    fn set_counts_distinct_values() {
        let mut generator = Generator::new(MetricType::Set, NOW);
        for value in [1.0, 2.0, 2.0, 3.0, 1.0] {
            sample(&mut generator, value, NOW);
        }

        let flushed = flush(&mut generator, NOW);
        assert_eq!(values(&flushed), vec![3.0]);
        assert_eq!(flushed[0].metric_type, MetricType::Gauge);
        assert!(flush(&mut generator, NOW + 10).is_empty());
    }

    #[test]
    fn histogram_percentile() {
        let config = HistogramConfiguration {
            aggregates: vec![],
            percentiles: vec![0.95],
        };

        let mut generator = Generator::new(MetricType::Histogram, NOW);
        // Insert out of order to make sure flush sorts.
        for value in (1..=100).rev() {
            sample(&mut generator, value as f64, NOW);
        }

        let flushed = flush_with(&mut generator, &config, NOW, 10.0);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].name, "test.metric.95percentile");
        assert_eq!(flushed[0].value, Some(95.0));
    }

    #[test]
    fn histogram_count_is_rate_over_interval() {
        let config = HistogramConfiguration {
            aggregates: vec![crate::aggregate::HistogramAggregate::Count],
            percentiles: vec![],
        };

        let mut generator = Generator::new(MetricType::Histogram, NOW);
        for _ in 0..4000 {
            sample(&mut generator, 1.0, NOW);
        }

        let flushed = flush_with(&mut generator, &config, NOW, 1.0);
        assert_eq!(flushed[0].name, "test.metric.count");
        assert_eq!(flushed[0].value, Some(4000.0));
        assert_eq!(flushed[0].metric_type, MetricType::Rate);

        // Sample rate scales the logical count only.
        generator.sample("test.metric", 1.0, 0.5, None, NOW).unwrap();
        let flushed = flush_with(&mut generator, &config, NOW, 2.0);
        assert_eq!(flushed[0].value, Some(1.0));
    }

    #[test]
    fn histogram_default_aggregates() {
        let mut generator = Generator::new(MetricType::Histogram, NOW);
        for value in [4.0, 1.0, 3.0, 2.0] {
            sample(&mut generator, value, NOW);
        }

        let flushed = flush_with(&mut generator, &HistogramConfiguration::default(), NOW, 2.0);
        let named = flushed
            .iter()
            .map(|m| (m.name.as_str(), m.value.unwrap_or_default()))
            .collect::<Vec<_>>();
        similar_asserts::assert_eq!(
            named,
            vec![
                ("test.metric.max", 4.0),
                ("test.metric.median", 2.0),
                ("test.metric.avg", 2.5),
                ("test.metric.count", 2.0),
                ("test.metric.95percentile", 4.0),
            ]
        );
        assert!(flushed.iter().all(|m| m.tags.contains("env:test") && m.hostname == "host-a"));

        assert!(flush(&mut generator, NOW + 10).is_empty());
    }

    #[test]
    fn histogram_single_sample() {
        let config = HistogramConfiguration {
            aggregates: vec![
                crate::aggregate::HistogramAggregate::Min,
                crate::aggregate::HistogramAggregate::Median,
            ],
            percentiles: vec![0.5],
        };

        let mut generator = Generator::new(MetricType::Histogram, NOW);
        sample(&mut generator, 42.0, NOW);

        assert_eq!(values(&flush_with(&mut generator, &config, NOW, 10.0)), vec![42.0, 42.0, 42.0]);
    }

    #[test]
    fn histogram_extreme_samples_flush_finite_values() {
        let config = HistogramConfiguration {
            aggregates: vec![
                crate::aggregate::HistogramAggregate::Max,
                crate::aggregate::HistogramAggregate::Avg,
            ],
            percentiles: vec![],
        };

        let mut generator = Generator::new(MetricType::Histogram, NOW);
        sample(&mut generator, 1.7e308, NOW);
        sample(&mut generator, 1.7e308, NOW);

        let flushed = flush_with(&mut generator, &config, NOW, 10.0);
        assert!(flushed.iter().all(|metric| metric.value.is_some_and(f64::is_finite)));
        assert_eq!(values(&flushed), vec![1.7e308, 1.7e308]);
    }
}
