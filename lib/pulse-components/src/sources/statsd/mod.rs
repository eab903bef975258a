//! Statsd source.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use bytes::Bytes;
use metrics::{counter, Counter};
use pulse_config::GenericConfiguration;
use pulse_core::{
    aggregate::{Aggregator, AggregatorConfiguration},
    metric::Metric,
    runtime::{ShutdownCoordinator, ShutdownSignal},
    task::spawn_traced,
    time::get_unix_timestamp,
};
use pulse_error::GenericError;
use pulse_io::{
    deser::statsd::{StatsdCodecConfiguration, StatsdDecoder},
    net::udp::UdpListener,
};
use serde::Deserialize;
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, info_span, trace, warn, Instrument as _};

const PACKET_CHANNEL_SIZE: usize = 1024;

const fn default_enabled() -> bool {
    true
}

const fn default_listen_address() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8125))
}

const fn default_flush_interval_secs() -> u64 {
    10
}

const fn default_buffer_size() -> usize {
    8192
}

const fn default_max_tags() -> usize {
    usize::MAX
}

const fn default_timestamps_enabled() -> bool {
    true
}

/// Statsd source configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct StatsdConfiguration {
    /// Whether the statsd listener is enabled.
    ///
    /// Defaults to `true`.
    #[serde(rename = "statsd_enabled", default = "default_enabled")]
    pub enabled: bool,

    /// Address to listen on.
    ///
    /// Defaults to `127.0.0.1:8125`.
    #[serde(rename = "statsd_listen_address", default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// How often aggregated metrics are flushed, in seconds.
    ///
    /// Defaults to 10 seconds.
    #[serde(rename = "statsd_flush_interval_secs", default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Receive buffer size, in bytes. Larger datagrams are truncated.
    ///
    /// Defaults to 8192 bytes.
    #[serde(rename = "statsd_buffer_size", default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Whether to accept any non-empty metric name.
    ///
    /// Defaults to `false`.
    #[serde(rename = "statsd_permissive_decoding", default)]
    pub permissive_decoding: bool,

    /// Maximum number of tags kept per metric. Extra tags are discarded.
    ///
    /// Defaults to no limit.
    #[serde(rename = "statsd_max_tags", default = "default_max_tags")]
    pub max_tags: usize,

    /// Whether client-provided `T<timestamp>` values are honored.
    ///
    /// Defaults to `true`.
    #[serde(rename = "statsd_timestamps_enabled", default = "default_timestamps_enabled")]
    pub timestamps_enabled: bool,

    /// Aggregation settings.
    #[serde(flatten)]
    pub aggregator: AggregatorConfiguration,
}

impl StatsdConfiguration {
    /// Creates a new `StatsdConfiguration` from the given configuration.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    /// Binds the listener and creates the source.
    ///
    /// # Errors
    ///
    /// If the listen address cannot be bound, an error is returned.
    pub async fn build(&self) -> Result<StatsdSource, GenericError> {
        let listener = UdpListener::bind(self.listen_address, self.buffer_size).await?;
        let codec_config = StatsdCodecConfiguration::default()
            .with_permissive_mode(self.permissive_decoding)
            .with_maximum_tag_count(self.max_tags)
            .with_timestamps(self.timestamps_enabled);

        Ok(StatsdSource {
            listener,
            decoder: StatsdDecoder::new(codec_config),
            flush_interval: self.flush_interval(),
            aggregator_config: self.aggregator.clone(),
        })
    }
}

impl Default for StatsdConfiguration {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            listen_address: default_listen_address(),
            flush_interval_secs: default_flush_interval_secs(),
            buffer_size: default_buffer_size(),
            permissive_decoding: false,
            max_tags: default_max_tags(),
            timestamps_enabled: default_timestamps_enabled(),
            aggregator: AggregatorConfiguration::default(),
        }
    }
}

struct Telemetry {
    packets_received: Counter,
    bytes_received: Counter,
    receive_errors: Counter,
    metrics_decoded: Counter,
    decode_errors: Counter,
    samples_rejected: Counter,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            packets_received: counter!("statsd_packets_received_total"),
            bytes_received: counter!("statsd_bytes_received_total"),
            receive_errors: counter!("statsd_receive_errors_total"),
            metrics_decoded: counter!("statsd_metrics_decoded_total"),
            decode_errors: counter!("statsd_decode_errors_total"),
            samples_rejected: counter!("statsd_samples_rejected_total"),
        }
    }

    #[cfg(test)]
    fn noop() -> Self {
        Self {
            packets_received: Counter::noop(),
            bytes_received: Counter::noop(),
            receive_errors: Counter::noop(),
            metrics_decoded: Counter::noop(),
            decode_errors: Counter::noop(),
            samples_rejected: Counter::noop(),
        }
    }
}

/// Statsd source.
///
/// Receives statsd packets over UDP and aggregates them, flushing on a fixed interval. Receiving and aggregation run
/// as two tasks connected by a bounded channel.
pub struct StatsdSource {
    listener: UdpListener,
    decoder: StatsdDecoder,
    flush_interval: Duration,
    aggregator_config: AggregatorConfiguration,
}

impl StatsdSource {
    /// Returns the address the source is listening on.
    ///
    /// # Errors
    ///
    /// If the local address cannot be queried, an error is returned.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawns the receive and aggregation tasks.
    ///
    /// Flushed metrics are sent to `metrics_tx`. On shutdown, whatever has been aggregated so far is flushed one last
    /// time.
    pub fn spawn(self, shutdown: &ShutdownCoordinator, metrics_tx: mpsc::Sender<Vec<Metric>>) -> Vec<JoinHandle<()>> {
        let (packets_tx, packets_rx) = mpsc::channel(PACKET_CHANNEL_SIZE);

        let aggregator = StatsdAggregator {
            decoder: self.decoder,
            aggregator: Aggregator::new(self.aggregator_config, self.flush_interval),
            flush_interval: self.flush_interval,
            metrics_tx,
            telemetry: Telemetry::new(),
        };

        let span = info_span!("statsd");
        vec![
            spawn_traced(
                run_listener(self.listener, packets_tx, shutdown.register(), Telemetry::new()).instrument(span.clone()),
            ),
            spawn_traced(aggregator.run(packets_rx, shutdown.register()).instrument(span)),
        ]
    }
}

async fn run_listener(
    mut listener: UdpListener, packets_tx: mpsc::Sender<Bytes>, shutdown: ShutdownSignal, telemetry: Telemetry,
) {
    if let Ok(address) = listener.local_addr() {
        info!(%address, "Statsd listener started.");
    }

    loop {
        select! {
            _ = shutdown.wait() => {
                debug!("Received shutdown signal.");
                break;
            },
            result = listener.receive() => match result {
                Ok((packet, peer)) => {
                    trace!(%peer, len = packet.len(), "Received packet.");
                    telemetry.packets_received.increment(1);
                    telemetry.bytes_received.increment(packet.len() as u64);

                    if packets_tx.send(packet).await.is_err() {
                        error!("Packet channel closed. Stopping listener.");
                        break;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Failed to receive packet.");
                    telemetry.receive_errors.increment(1);
                },
            },
        }
    }

    debug!("Statsd listener stopped.");
}

struct StatsdAggregator {
    decoder: StatsdDecoder,
    aggregator: Aggregator,
    flush_interval: Duration,
    metrics_tx: mpsc::Sender<Vec<Metric>>,
    telemetry: Telemetry,
}

impl StatsdAggregator {
    async fn run(mut self, mut packets_rx: mpsc::Receiver<Bytes>, shutdown: ShutdownSignal) {
        let mut flush = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut decoded = Vec::new();

        loop {
            select! {
                _ = shutdown.wait() => {
                    debug!("Received shutdown signal. Performing final flush.");
                    break;
                },
                _ = flush.tick() => {
                    if !self.flush().await {
                        return;
                    }
                },
                maybe_packet = packets_rx.recv() => match maybe_packet {
                    Some(packet) => self.handle_packet(&packet, &mut decoded),
                    None => break,
                },
            }
        }

        // Anything already received is still aggregated.
        while let Ok(packet) = packets_rx.try_recv() {
            self.handle_packet(&packet, &mut decoded);
        }
        self.flush().await;

        debug!("Statsd aggregator stopped.");
    }

    fn handle_packet(&mut self, packet: &[u8], decoded: &mut Vec<Metric>) {
        let summary = self.decoder.decode_packet(packet, decoded);
        self.telemetry.metrics_decoded.increment(summary.decoded as u64);
        self.telemetry.decode_errors.increment(summary.rejected as u64);

        let now = get_unix_timestamp();
        for metric in decoded.drain(..) {
            let metric_type = metric.metric_type;
            if let Err(e) = self.aggregator.add(metric_type, metric, now) {
                warn!(error = %e, "Dropped invalid statsd sample.");
                self.telemetry.samples_rejected.increment(1);
            }
        }
    }

    /// Returns `false` if the downstream channel is closed.
    async fn flush(&mut self) -> bool {
        let metrics = self.aggregator.flush(get_unix_timestamp());
        if metrics.is_empty() {
            return true;
        }

        let flushed = metrics.len();
        match self.metrics_tx.send(metrics).await {
            Ok(()) => {
                debug!(flushed, contexts = self.aggregator.context_count(), "Flushed statsd metrics.");
                true
            }
            Err(_) => {
                error!("Metrics channel closed. Stopping statsd aggregator.");
                false
            }
        }
    }
}
