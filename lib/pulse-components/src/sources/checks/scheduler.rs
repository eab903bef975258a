use std::{any::Any, sync::Arc, time::Duration};

use metrics::{counter, Counter};
use pulse_core::{
    aggregate::{Aggregator, AggregatorConfiguration},
    metric::Metric,
    runtime::{ShutdownCoordinator, ShutdownSignal},
    task::spawn_traced,
    time::get_unix_timestamp,
};
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info_span, trace, warn, Instrument as _};

use super::{Check, CheckRegistry, ChecksConfiguration, SampleBatch};

/// Runs every registered check on a fixed interval.
///
/// Each check gets its own task and its own aggregator. A run that panics, fails, or outlives the interval is logged
/// and counted, and the check is run again on the next tick.
pub struct Scheduler {
    interval: Duration,
    aggregator_config: AggregatorConfiguration,
    registry: CheckRegistry,
    metrics_tx: mpsc::Sender<Vec<Metric>>,
}

impl Scheduler {
    /// Creates a new `Scheduler`.
    ///
    /// Flushed metrics are sent to `metrics_tx`. When the channel is full, the next run of the check is delayed until
    /// there is room.
    pub fn new(config: &ChecksConfiguration, registry: CheckRegistry, metrics_tx: mpsc::Sender<Vec<Metric>>) -> Self {
        Self {
            interval: config.interval(),
            aggregator_config: config.aggregator.clone(),
            registry,
            metrics_tx,
        }
    }

    /// Spawns one task per registered check.
    ///
    /// Tasks stop once `shutdown` is triggered.
    pub fn spawn(self, shutdown: &ShutdownCoordinator) -> Vec<JoinHandle<()>> {
        debug!(
            checks = self.registry.len(),
            interval_secs = self.interval.as_secs(),
            "Scheduling checks."
        );

        self.registry
            .iter()
            .map(|check| {
                let span = info_span!("check", check_id = check.id());
                let runner = CheckRunner::new(
                    Arc::clone(check),
                    self.interval,
                    &self.aggregator_config,
                    self.metrics_tx.clone(),
                );
                spawn_traced(runner.run(shutdown.register()).instrument(span))
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CycleOutcome {
    Completed,
    Failed,
    TimedOut,
    Panicked,
    Abandoned,
}

struct Telemetry {
    runs_completed: Counter,
    runs_failed: Counter,
    runs_timed_out: Counter,
    runs_panicked: Counter,
    samples_rejected: Counter,
}

impl Telemetry {
    fn new(check_id: &str) -> Self {
        let check_id = check_id.to_string();

        Self {
            runs_completed: counter!("check_runs_total", "check_id" => check_id.clone(), "outcome" => "completed"),
            runs_failed: counter!("check_runs_total", "check_id" => check_id.clone(), "outcome" => "failed"),
            runs_timed_out: counter!("check_runs_total", "check_id" => check_id.clone(), "outcome" => "timed_out"),
            runs_panicked: counter!("check_runs_total", "check_id" => check_id.clone(), "outcome" => "panicked"),
            samples_rejected: counter!("check_samples_rejected_total", "check_id" => check_id),
        }
    }

    #[cfg(test)]
    fn noop() -> Self {
        Self {
            runs_completed: Counter::noop(),
            runs_failed: Counter::noop(),
            runs_timed_out: Counter::noop(),
            runs_panicked: Counter::noop(),
            samples_rejected: Counter::noop(),
        }
    }

    fn record(&self, outcome: CycleOutcome) {
        match outcome {
            CycleOutcome::Completed => self.runs_completed.increment(1),
            CycleOutcome::Failed => self.runs_failed.increment(1),
            CycleOutcome::TimedOut => self.runs_timed_out.increment(1),
            CycleOutcome::Panicked => self.runs_panicked.increment(1),
            CycleOutcome::Abandoned => {}
        }
    }
}

struct CheckRunner {
    check: Arc<dyn Check>,
    interval: Duration,
    aggregator: Aggregator,
    metrics_tx: mpsc::Sender<Vec<Metric>>,
    telemetry: Telemetry,
}

impl CheckRunner {
    fn new(
        check: Arc<dyn Check>, interval: Duration, aggregator_config: &AggregatorConfiguration,
        metrics_tx: mpsc::Sender<Vec<Metric>>,
    ) -> Self {
        let telemetry = Telemetry::new(check.id());

        Self {
            check,
            interval,
            aggregator: Aggregator::new(aggregator_config.clone(), interval),
            metrics_tx,
            telemetry,
        }
    }

    async fn run(mut self, shutdown: ShutdownSignal) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("Check runner started.");

        loop {
            select! {
                _ = shutdown.wait() => {
                    debug!("Received shutdown signal.");
                    break;
                },
                _ = ticker.tick() => {
                    if self.run_once(&shutdown).await == CycleOutcome::Abandoned {
                        break;
                    }
                },
            }
        }

        debug!("Check runner stopped.");
    }

    async fn run_once(&mut self, shutdown: &ShutdownSignal) -> CycleOutcome {
        let check = Arc::clone(&self.check);
        let cancel = shutdown.child_token();
        let run_cancel = cancel.clone();

        // The run is spawned so that a panic stays inside its own task.
        let mut handle = tokio::spawn(async move {
            let mut batch = SampleBatch::new();
            check.run(&mut batch, run_cancel).await.map(|()| batch)
        });

        let result = select! {
            _ = shutdown.wait() => {
                debug!("Abandoning in-flight check run.");
                return CycleOutcome::Abandoned;
            },
            result = timeout(self.interval, &mut handle) => result,
        };

        let outcome = match result {
            Err(_) => {
                // The run keeps going in the background; it is only asked to stop.
                warn!(
                    timeout_secs = self.interval.as_secs(),
                    "Check run did not complete within its interval."
                );
                cancel.cancel();
                CycleOutcome::TimedOut
            }
            Ok(Err(e)) if e.is_panic() => {
                error!(panic = %panic_message(e.into_panic()), "Check run panicked.");
                CycleOutcome::Panicked
            }
            Ok(Err(e)) => {
                error!(error = %e, "Check run was aborted.");
                CycleOutcome::Failed
            }
            Ok(Ok(Err(e))) => {
                error!(error = %e, "Check run failed.");
                CycleOutcome::Failed
            }
            Ok(Ok(Ok(batch))) => self.complete(batch, shutdown).await,
        };

        self.telemetry.record(outcome);
        outcome
    }

    async fn complete(&mut self, batch: SampleBatch, shutdown: &ShutdownSignal) -> CycleOutcome {
        let now = get_unix_timestamp();

        let rejected = batch.apply(&mut self.aggregator, now);
        if rejected > 0 {
            self.telemetry.samples_rejected.increment(rejected as u64);
        }

        let metrics = self.aggregator.flush(now);
        if metrics.is_empty() {
            return CycleOutcome::Completed;
        }

        let flushed = metrics.len();
        select! {
            _ = shutdown.wait() => CycleOutcome::Abandoned,
            result = self.metrics_tx.send(metrics) => match result {
                Ok(()) => {
                    trace!(flushed, "Forwarded flushed metrics.");
                    CycleOutcome::Completed
                },
                Err(_) => {
                    error!("Metrics channel closed. Stopping check.");
                    CycleOutcome::Abandoned
                },
            },
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
