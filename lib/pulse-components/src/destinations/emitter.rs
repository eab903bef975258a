use std::time::Duration;

use metrics::{counter, gauge, Counter, Gauge};
use pulse_config::GenericConfiguration;
use pulse_core::{
    buffer::{Buffer, OverflowPolicy},
    metric::Metric,
    runtime::ShutdownSignal,
};
use pulse_error::GenericError;
use pulse_io::deliver::Deliver;
use serde::Deserialize;
use tokio::{
    select,
    sync::mpsc,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const fn default_buffer_capacity() -> usize {
    10_000
}

const fn default_retry_buffer_capacity() -> usize {
    100
}

const fn default_batch_size() -> usize {
    500
}

const fn default_emit_interval_secs() -> u64 {
    10
}

/// Emitter configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct EmitterConfiguration {
    /// Maximum number of metrics waiting for delivery.
    ///
    /// Metrics arriving while the buffer is full are dropped and counted. Defaults to 10000.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Maximum number of failed batches waiting to be retried.
    ///
    /// When full, the oldest pending batch is dropped to make room. Defaults to 100.
    #[serde(default = "default_retry_buffer_capacity")]
    pub retry_buffer_capacity: usize,

    /// Maximum number of metrics per delivered batch.
    ///
    /// Defaults to 500.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How often buffered metrics are delivered, in seconds.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_emit_interval_secs")]
    pub emit_interval_secs: u64,
}

impl EmitterConfiguration {
    /// Creates a new `EmitterConfiguration` from the given configuration.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }
}

impl Default for EmitterConfiguration {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            retry_buffer_capacity: default_retry_buffer_capacity(),
            batch_size: default_batch_size(),
            emit_interval_secs: default_emit_interval_secs(),
        }
    }
}

struct Telemetry {
    metrics_dropped: Counter,
    batches_delivered: Counter,
    batches_failed: Counter,
    batches_dropped: Counter,
    metrics_delivered: Counter,
    buffer_len: Gauge,
    retry_buffer_len: Gauge,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            metrics_dropped: counter!("emitter_metrics_dropped_total"),
            batches_delivered: counter!("emitter_batches_delivered_total"),
            batches_failed: counter!("emitter_batches_failed_total"),
            batches_dropped: counter!("emitter_batches_dropped_total"),
            metrics_delivered: counter!("emitter_metrics_delivered_total"),
            buffer_len: gauge!("emitter_buffer_len"),
            retry_buffer_len: gauge!("emitter_retry_buffer_len"),
        }
    }

    #[cfg(test)]
    fn noop() -> Self {
        Self {
            metrics_dropped: Counter::noop(),
            batches_delivered: Counter::noop(),
            batches_failed: Counter::noop(),
            batches_dropped: Counter::noop(),
            metrics_delivered: Counter::noop(),
            buffer_len: Gauge::noop(),
            retry_buffer_len: Gauge::noop(),
        }
    }
}

/// Buffers aggregated metrics and delivers them in batches.
///
/// Metrics are held in a bounded buffer that rejects new metrics when full. On every pass, batches that previously
/// failed are retried first, oldest first, and the first failure ends the pass so that delivery order is kept. New
/// batches are only attempted once no retries are pending. A batch that fails, or that could not be attempted because
/// retries are stalled, is moved to a bounded retry buffer, which drops its oldest batch when full.
pub struct Emitter<D> {
    sink: D,
    primary: Buffer<Metric>,
    retry: Buffer<Vec<Metric>>,
    batch_size: usize,
    emit_interval: Duration,
    telemetry: Telemetry,
}

impl<D: Deliver> Emitter<D> {
    /// Creates a new `Emitter` delivering to `sink`.
    pub fn new(config: &EmitterConfiguration, sink: D) -> Self {
        Self {
            sink,
            primary: Buffer::new("primary", config.buffer_capacity, OverflowPolicy::RejectNewest),
            retry: Buffer::new("retry", config.retry_buffer_capacity, OverflowPolicy::DropOldest),
            batch_size: config.batch_size.max(1),
            emit_interval: Duration::from_secs(config.emit_interval_secs.max(1)),
            telemetry: Telemetry::new(),
        }
    }

    /// Runs the emitter until shutdown.
    ///
    /// After shutdown is triggered, metrics still arriving on `metrics_rx` are buffered until every sender is gone,
    /// and then everything buffered gets one final delivery attempt.
    pub async fn run(mut self, mut metrics_rx: mpsc::Receiver<Vec<Metric>>, shutdown: ShutdownSignal) {
        let mut ticker = interval_at(Instant::now() + self.emit_interval, self.emit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("Emitter started.");

        loop {
            select! {
                _ = shutdown.wait() => {
                    debug!("Received shutdown signal.");
                    break;
                },
                _ = ticker.tick() => {
                    self.emit_pass().await;
                },
                maybe_metrics = metrics_rx.recv() => match maybe_metrics {
                    Some(metrics) => {
                        self.enqueue(metrics);
                        if self.primary.len() >= self.batch_size {
                            self.emit_pass().await;
                        }
                    },
                    None => {
                        debug!("All producers stopped.");
                        break;
                    },
                },
            }
        }

        // Producers flush one last time on their way out.
        let drain = async {
            while let Some(metrics) = metrics_rx.recv().await {
                self.enqueue(metrics);
            }
        };
        if timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("Timed out waiting for producers to stop. Proceeding with final delivery.");
        }

        while !(self.primary.is_empty() && self.retry.is_empty()) {
            if !self.emit_pass().await {
                break;
            }
        }

        let undelivered = self.primary.len() + self.retry.iter().map(Vec::len).sum::<usize>();
        if undelivered > 0 {
            warn!(undelivered, "Stopping with undelivered metrics.");
        }

        info!(
            total = self.primary.total(),
            dropped = self.primary.drops(),
            dropped_retries = self.retry.drops(),
            "Emitter stopped."
        );
    }

    /// Adds metrics to the buffer.
    ///
    /// Metrics that do not fit are dropped and counted.
    pub fn enqueue(&mut self, metrics: Vec<Metric>) {
        let dropped = self.primary.add(metrics);
        if dropped > 0 {
            warn!(
                dropped,
                capacity = self.primary.capacity(),
                "Metrics buffer full. Dropped metrics."
            );
            self.telemetry.metrics_dropped.increment(dropped);
        }
        self.telemetry.buffer_len.set(self.primary.len() as f64);
    }

    /// Performs one delivery pass.
    ///
    /// Returns `true` if every attempted batch was delivered.
    pub async fn emit_pass(&mut self) -> bool {
        let delivered = if self.deliver_retries().await {
            self.deliver_buffered().await
        } else {
            // Retries are stalled. The next batch still moves along behind them, unattempted, so the buffer keeps
            // draining while order is preserved.
            if !self.primary.is_empty() {
                let batch = self.primary.batch(self.batch_size);
                self.queue_retry(batch);
            }
            false
        };

        self.telemetry.buffer_len.set(self.primary.len() as f64);
        self.telemetry.retry_buffer_len.set(self.retry.len() as f64);
        delivered
    }

    async fn deliver_retries(&mut self) -> bool {
        while let Some(batch) = self.retry.front() {
            let batch_len = batch.len();

            if let Err(e) = self.sink.deliver(batch).await {
                warn!(error = %e, pending = self.retry.len(), "Failed to redeliver batch.");
                self.telemetry.batches_failed.increment(1);
                return false;
            }

            self.retry.pop();
            self.record_delivery(batch_len);
        }

        true
    }

    async fn deliver_buffered(&mut self) -> bool {
        while !self.primary.is_empty() {
            let batch = self.primary.batch(self.batch_size);

            if let Err(e) = self.sink.deliver(&batch).await {
                warn!(error = %e, metrics = batch.len(), "Failed to deliver batch. Queued for retry.");
                self.telemetry.batches_failed.increment(1);
                self.queue_retry(batch);
                return false;
            }

            self.record_delivery(batch.len());
        }

        true
    }

    fn queue_retry(&mut self, batch: Vec<Metric>) {
        if !self.retry.push(batch) {
            warn!(
                capacity = self.retry.capacity(),
                "Retry buffer full. Dropped oldest pending batch."
            );
            self.telemetry.batches_dropped.increment(1);
        }
    }

    fn record_delivery(&self, metrics: usize) {
        debug!(metrics, "Delivered batch.");
        self.telemetry.batches_delivered.increment(1);
        self.telemetry.metrics_delivered.increment(metrics as u64);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use pulse_core::{metric::MetricType, runtime::ShutdownCoordinator};
    use pulse_io::deliver::DeliveryError;
    use similar_asserts::assert_eq;

    use super::*;

    /// Records every attempted batch by the names it contains, failing according to a script.
    #[derive(Clone, Default)]
    struct MockSink {
        script: Arc<Mutex<VecDeque<bool>>>,
        attempts: Arc<Mutex<Vec<(Vec<String>, bool)>>>,
    }

    impl MockSink {
        fn failing_next(&self, outcomes: &[bool]) {
            self.script.lock().unwrap().extend(outcomes.iter().copied());
        }

        fn attempts(&self) -> Vec<(Vec<String>, bool)> {
            self.attempts.lock().unwrap().clone()
        }

        fn delivered(&self) -> Vec<Vec<String>> {
            self.attempts()
                .into_iter()
                .filter(|(_, ok)| *ok)
                .map(|(names, _)| names)
                .collect()
        }
    }

    #[async_trait]
    impl Deliver for MockSink {
        async fn deliver(&self, batch: &[Metric]) -> Result<(), DeliveryError> {
            // Scripted outcomes are consumed first; once exhausted every delivery succeeds.
            let ok = self.script.lock().unwrap().pop_front().unwrap_or(true);
            let names = batch.iter().map(|m| m.name.clone()).collect();
            self.attempts.lock().unwrap().push((names, ok));

            if ok {
                Ok(())
            } else {
                Err(DeliveryError::Rejected { status: 503 })
            }
        }
    }

    fn metrics(names: &[&str]) -> Vec<Metric> {
        names
            .iter()
            .map(|name| Metric::new(*name, MetricType::Gauge).with_value(1.0))
            .collect()
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn emitter(sink: MockSink, buffer_capacity: usize, retry_buffer_capacity: usize) -> Emitter<MockSink> {
        let config = EmitterConfiguration {
            buffer_capacity,
            retry_buffer_capacity,
            batch_size: 2,
            emit_interval_secs: 10,
        };
        let mut emitter = Emitter::new(&config, sink);
        emitter.telemetry = Telemetry::noop();
        emitter
    }

    #[tokio::test]
    async fn delivers_in_batches() {
        let sink = MockSink::default();
        let mut emitter = emitter(sink.clone(), 10, 10);

        emitter.enqueue(metrics(&["a", "b", "c"]));
        assert!(emitter.emit_pass().await);
        assert!(emitter.primary.is_empty());

        assert_eq!(sink.delivered(), vec![names(&["a", "b"]), names(&["c"])]);
    }

    #[tokio::test]
    async fn pass_drains_batches_until_first_failure() {
        let sink = MockSink::default();
        let mut emitter = emitter(sink.clone(), 10, 10);

        emitter.enqueue(metrics(&["a", "b", "c", "d", "e", "f"]));
        sink.failing_next(&[true, false]);
        assert!(!emitter.emit_pass().await);

        // The batch after the failed one is left in the primary buffer, unattempted.
        assert_eq!(
            sink.attempts(),
            vec![(names(&["a", "b"]), true), (names(&["c", "d"]), false)]
        );
        assert_eq!(emitter.retry.len(), 1);
        assert_eq!(emitter.primary.len(), 2);
    }

    #[tokio::test]
    async fn failed_batch_is_retried_before_newer_batches() {
        let sink = MockSink::default();
        let mut emitter = emitter(sink.clone(), 10, 10);

        sink.failing_next(&[false]);
        emitter.enqueue(metrics(&["a", "b", "c"]));
        assert!(!emitter.emit_pass().await);
        assert_eq!(emitter.retry.len(), 1);
        assert_eq!(emitter.primary.len(), 1);

        emitter.enqueue(metrics(&["d"]));
        assert!(emitter.emit_pass().await);
        assert!(emitter.retry.is_empty());

        assert_eq!(sink.delivered(), vec![names(&["a", "b"]), names(&["c", "d"])]);
    }

    #[tokio::test]
    async fn stalled_retries_hold_back_newer_batches() {
        let sink = MockSink::default();
        let mut emitter = emitter(sink.clone(), 10, 10);

        emitter.enqueue(metrics(&["a", "b", "c", "d", "e"]));

        sink.failing_next(&[false]);
        assert!(!emitter.emit_pass().await);

        // The retry fails again, so the next batch is queued behind it without being attempted.
        sink.failing_next(&[false]);
        assert!(!emitter.emit_pass().await);
        assert_eq!(emitter.retry.len(), 2);
        assert_eq!(emitter.primary.len(), 1);
        assert_eq!(
            sink.attempts(),
            vec![(names(&["a", "b"]), false), (names(&["a", "b"]), false)]
        );

        assert!(emitter.emit_pass().await);
        assert_eq!(
            sink.delivered(),
            vec![names(&["a", "b"]), names(&["c", "d"]), names(&["e"])]
        );
    }

    #[tokio::test]
    async fn full_buffer_rejects_newest() {
        let sink = MockSink::default();
        let mut emitter = emitter(sink.clone(), 3, 1);

        emitter.enqueue(metrics(&["a", "b", "c", "d", "e"]));
        assert_eq!(emitter.primary.len(), 3);
        assert_eq!(emitter.primary.drops(), 2);
        assert_eq!(emitter.primary.total(), 5);

        assert!(emitter.emit_pass().await);
        assert_eq!(sink.delivered(), vec![names(&["a", "b"]), names(&["c"])]);
    }

    #[tokio::test]
    async fn full_retry_buffer_drops_oldest_batch() {
        let sink = MockSink::default();
        let mut emitter = emitter(sink.clone(), 10, 1);

        emitter.enqueue(metrics(&["a", "b", "c", "d"]));
        sink.failing_next(&[false, false]);
        emitter.emit_pass().await;
        emitter.emit_pass().await;

        assert_eq!(emitter.retry.len(), 1);
        assert_eq!(emitter.retry.drops(), 1);

        assert!(emitter.emit_pass().await);
        assert_eq!(sink.delivered(), vec![names(&["c", "d"])]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_delivers_on_tick_and_flushes_on_shutdown() {
        let sink = MockSink::default();
        let emitter = emitter(sink.clone(), 10, 10);

        let (metrics_tx, metrics_rx) = mpsc::channel(8);
        let coordinator = ShutdownCoordinator::new();
        let handle = tokio::spawn(emitter.run(metrics_rx, coordinator.register()));

        metrics_tx.send(metrics(&["a"])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(sink.delivered(), vec![names(&["a"])]);

        coordinator.shutdown();
        metrics_tx.send(metrics(&["late"])).await.unwrap();
        drop(metrics_tx);
        handle.await.unwrap();

        assert_eq!(sink.delivered(), vec![names(&["a"]), names(&["late"])]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_emits_early_once_a_batch_is_full() {
        let sink = MockSink::default();
        let emitter = emitter(sink.clone(), 10, 10);

        let (metrics_tx, metrics_rx) = mpsc::channel(8);
        let coordinator = ShutdownCoordinator::new();
        let handle = tokio::spawn(emitter.run(metrics_rx, coordinator.register()));

        metrics_tx.send(metrics(&["a", "b"])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.delivered(), vec![names(&["a", "b"])]);

        coordinator.shutdown();
        drop(metrics_tx);
        handle.await.unwrap();
    }
}
