//! Internal telemetry.
//!
//! Components record telemetry through the `metrics` crate. Once [`initialize_metrics`] installs the global recorder,
//! those values accumulate in an in-process registry which can be snapshotted with [`collect_internal_metrics`] and fed
//! back through the normal aggregation pipeline like any other source.

use std::sync::{atomic::Ordering, Arc, OnceLock};

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry};
use pulse_error::{generic_error, GenericError};

use crate::metric::{Metric, MetricType};

static RECORDER_STATE: OnceLock<Arc<State>> = OnceLock::new();

struct State {
    registry: Registry<Key, AtomicStorage>,
    metrics_prefix: String,
}

impl State {
    fn new(metrics_prefix: String) -> Self {
        Self {
            registry: Registry::new(AtomicStorage),
            metrics_prefix,
        }
    }

    fn prefix_key(&self, key: &Key) -> Key {
        Key::from_parts(format!("{}.{}", self.metrics_prefix, key.name()), key.labels())
    }

    fn snapshot(&self) -> Vec<Metric> {
        let mut metrics = Vec::new();

        // Counters are reported as raw, ever-increasing readings, and turned into per-interval deltas downstream.
        for (key, counter) in self.registry.get_counter_handles() {
            let value = counter.load(Ordering::Relaxed) as f64;
            metrics.push(metric_from_key(key, MetricType::MonotonicCount, value));
        }

        for (key, gauge) in self.registry.get_gauge_handles() {
            let value = f64::from_bits(gauge.load(Ordering::Relaxed));
            metrics.push(metric_from_key(key, MetricType::Gauge, value));
        }

        metrics
    }
}

struct MetricsRecorder {
    state: Arc<State>,
}

impl Recorder for MetricsRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let prefixed_key = self.state.prefix_key(key);
        self.state
            .registry
            .get_or_create_counter(&prefixed_key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        let prefixed_key = self.state.prefix_key(key);
        self.state
            .registry
            .get_or_create_gauge(&prefixed_key, |g| g.clone().into())
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        // Internal telemetry only uses counters and gauges.
        Histogram::noop()
    }
}

fn metric_from_key(key: Key, metric_type: MetricType, value: f64) -> Metric {
    let (name, labels) = key.into_parts();
    let tags = labels.into_iter().map(|l| format!("{}:{}", l.key(), l.value()));

    Metric::new(name.as_str(), metric_type).with_value(value).with_tags(tags)
}

/// Installs the global telemetry recorder.
///
/// Every metric name is prefixed with `<metrics_prefix>.`.
///
/// # Errors
///
/// If a global recorder was already installed, an error is returned.
pub fn initialize_metrics(metrics_prefix: impl Into<String>) -> Result<(), GenericError> {
    let state = Arc::new(State::new(metrics_prefix.into()));
    let recorder = MetricsRecorder {
        state: Arc::clone(&state),
    };

    metrics::set_global_recorder(recorder).map_err(|_| generic_error!("Global metrics recorder already installed."))?;

    // The recorder is installed at most once, so the state can only be set here.
    let _ = RECORDER_STATE.set(state);
    Ok(())
}

/// Takes a snapshot of all internal telemetry.
///
/// Returns an empty snapshot if [`initialize_metrics`] has not been called.
pub fn collect_internal_metrics() -> Vec<Metric> {
    RECORDER_STATE.get().map(|state| state.snapshot()).unwrap_or_default()
}
