//! Metric model.

use std::{collections::BTreeSet, fmt, str::FromStr};

use snafu::Snafu;

mod context;
pub use self::context::Context;

/// Metric type.
///
/// Determines which aggregation state machine a metric is routed to. Flushed metrics only ever carry the types that
/// downstream consumers understand: gauge, counter, rate, and count.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricType {
    /// Last value wins.
    Gauge,

    /// Last value wins, always emitted as a gauge.
    BucketGauge,

    /// Sum of sample-rate-corrected values, emitted every flush.
    Counter,

    /// Per-second rate between the two most recent samples.
    Rate,

    /// Sum of values, emitted only when sampled.
    Count,

    /// Positive deltas between successive readings of an ever-increasing counter.
    MonotonicCount,

    /// Number of distinct values.
    Set,

    /// Distribution summarized into aggregates and percentiles.
    Histogram,
}

impl MetricType {
    /// Returns the canonical name of this metric type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::BucketGauge => "bucket_gauge",
            Self::Counter => "counter",
            Self::Rate => "rate",
            Self::Count => "count",
            Self::MonotonicCount => "monotonic_count",
            Self::Set => "set",
            Self::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unrecognized metric type name.
#[derive(Debug, Snafu)]
#[snafu(display("Unknown metric type '{}'.", type_name))]
pub struct UnknownMetricType {
    type_name: String,
}

impl FromStr for MetricType {
    type Err = UnknownMetricType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(Self::Gauge),
            "bucket_gauge" => Ok(Self::BucketGauge),
            "counter" => Ok(Self::Counter),
            "rate" => Ok(Self::Rate),
            "count" => Ok(Self::Count),
            "monotonic_count" => Ok(Self::MonotonicCount),
            "set" => Ok(Self::Set),
            "histogram" => Ok(Self::Histogram),
            other => Err(UnknownMetricType {
                type_name: other.to_string(),
            }),
        }
    }
}

/// A metric value was rejected before reaching aggregation state.
#[derive(Debug, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SampleError {
    /// The metric carried no value.
    #[snafu(display("Metric '{}' has no value.", name))]
    MissingValue {
        /// Metric name.
        name: String,
    },

    /// The value was NaN or infinite.
    #[snafu(display("Metric '{}' has non-finite value {}.", name, value))]
    NonFiniteValue {
        /// Metric name.
        name: String,

        /// Rejected value.
        value: f64,
    },
}

/// A metric.
///
/// Used both as the input to aggregation, where `value` may be absent and `timestamp` is an optional explicit sample
/// time, and as the output of a flush, where both are always populated.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// Metric name.
    pub name: String,

    /// Metric value.
    pub value: Option<f64>,

    /// Tags.
    pub tags: BTreeSet<String>,

    /// Hostname the metric is attributed to. Empty when unset.
    pub hostname: String,

    /// Device the metric is attributed to. Empty when unset.
    pub device_name: String,

    /// Explicit timestamp, in seconds since the Unix epoch.
    pub timestamp: Option<i64>,

    /// Time of the most recent sample that contributed to this metric, in seconds since the Unix epoch.
    pub last_sample_time: i64,

    /// Metric type.
    pub metric_type: MetricType,

    /// Fraction of events represented by this sample.
    pub sample_rate: f64,
}

impl Metric {
    /// Creates a new `Metric` with no value.
    pub fn new<N: Into<String>>(name: N, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            value: None,
            tags: BTreeSet::new(),
            hostname: String::new(),
            device_name: String::new(),
            timestamp: None,
            last_sample_time: 0,
            metric_type,
            sample_rate: 1.0,
        }
    }

    /// Sets the value.
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    /// Adds the given tags.
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Sets the hostname.
    pub fn with_hostname<H: Into<String>>(mut self, hostname: H) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Sets the device name.
    pub fn with_device_name<D: Into<String>>(mut self, device_name: D) -> Self {
        self.device_name = device_name.into();
        self
    }

    /// Sets an explicit timestamp.
    pub fn with_timestamp(mut self, timestamp: Option<i64>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the sample rate.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Returns the context of this metric.
    pub fn context(&self) -> Context {
        Context::new(
            self.name.as_str(),
            self.tags.iter().map(String::as_str),
            self.hostname.as_str(),
            self.device_name.as_str(),
        )
    }

    /// Returns the value if it is present and finite.
    ///
    /// # Errors
    ///
    /// If the value is missing, NaN, or infinite, an error is returned.
    pub fn validated_value(&self) -> Result<f64, SampleError> {
        match self.value {
            None => Err(SampleError::MissingValue { name: self.name.clone() }),
            Some(value) if !value.is_finite() => Err(SampleError::NonFiniteValue {
                name: self.name.clone(),
                value,
            }),
            Some(value) => Ok(value),
        }
    }
}
