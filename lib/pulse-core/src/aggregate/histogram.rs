use serde::Deserialize;

use super::generator::flushed_metric;
use crate::metric::{Context, Metric, MetricType};

fn default_aggregates() -> Vec<HistogramAggregate> {
    vec![
        HistogramAggregate::Max,
        HistogramAggregate::Median,
        HistogramAggregate::Avg,
        HistogramAggregate::Count,
    ]
}

fn default_percentiles() -> Vec<f64> {
    vec![0.95]
}

/// A summary statistic computed from histogram samples at flush time.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HistogramAggregate {
    /// Smallest sample.
    Min,

    /// Largest sample.
    Max,

    /// Middle sample. For an even number of samples, the lower of the two middle samples.
    Median,

    /// Arithmetic mean of the samples.
    Avg,

    /// Number of events per second over the flush interval, corrected for sample rate.
    Count,
}

impl HistogramAggregate {
    fn suffix(&self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Median => "median",
            Self::Avg => "avg",
            Self::Count => "count",
        }
    }
}

/// Histogram configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct HistogramConfiguration {
    /// Aggregates to emit on flush.
    ///
    /// Defaults to `max`, `median`, `avg`, and `count`.
    #[serde(rename = "histogram_aggregates", default = "default_aggregates")]
    pub aggregates: Vec<HistogramAggregate>,

    /// Percentiles to emit on flush, as fractions between 0 and 1.
    ///
    /// Defaults to `[0.95]`.
    #[serde(rename = "histogram_percentiles", default = "default_percentiles")]
    pub percentiles: Vec<f64>,
}

impl Default for HistogramConfiguration {
    fn default() -> Self {
        Self {
            aggregates: default_aggregates(),
            percentiles: default_percentiles(),
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct Histogram {
    samples: Vec<f64>,
    count: u64,
}

impl Histogram {
    pub fn sample(&mut self, value: f64, weight: u64) {
        self.samples.push(value);
        self.count += weight;
    }

    pub fn flush(
        &mut self, context: &Context, config: &HistogramConfiguration, timestamp: i64, interval_secs: f64,
        out: &mut Vec<Metric>,
    ) {
        if self.samples.is_empty() {
            return;
        }

        let mut samples = std::mem::take(&mut self.samples);
        let count = std::mem::take(&mut self.count);
        samples.sort_unstable_by(f64::total_cmp);

        let n = samples.len();
        for aggregate in &config.aggregates {
            let (value, metric_type) = match aggregate {
                HistogramAggregate::Min => (samples[0], MetricType::Gauge),
                HistogramAggregate::Max => (samples[n - 1], MetricType::Gauge),
                HistogramAggregate::Median => (samples[median_index(n)], MetricType::Gauge),
                HistogramAggregate::Avg => (mean(&samples), MetricType::Gauge),
                HistogramAggregate::Count => (count as f64 / interval_secs, MetricType::Rate),
            };

            out.push(flushed_metric(
                context,
                format!("{}.{}", context.name(), aggregate.suffix()),
                value,
                metric_type,
                timestamp,
            ));
        }

        for percentile in &config.percentiles {
            let value = samples[percentile_index(*percentile, n)];
            let name = format!("{}.{}percentile", context.name(), (percentile * 100.0).round() as u64);
            out.push(flushed_metric(context, name, value, MetricType::Gauge, timestamp));
        }
    }
}

// Running mean, which stays finite for any finite samples.
fn mean(samples: &[f64]) -> f64 {
    samples
        .iter()
        .enumerate()
        .fold(0.0, |mean, (i, value)| mean + (value - mean) / (i + 1) as f64)
}

fn median_index(n: usize) -> usize {
    if n % 2 == 0 {
        n / 2 - 1
    } else {
        n / 2
    }
}

fn percentile_index(percentile: f64, n: usize) -> usize {
    let rank = (percentile * n as f64).round() as i64 - 1;
    rank.clamp(0, n as i64 - 1) as usize
}
