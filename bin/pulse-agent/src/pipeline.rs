use std::time::Duration;

use pulse_components::{
    destinations::{Emitter, EmitterConfiguration, HttpSinkConfiguration},
    sources::{
        checks::{CheckRegistry, ChecksConfiguration, Scheduler},
        statsd::StatsdConfiguration,
    },
};
use pulse_config::GenericConfiguration;
use pulse_core::{runtime::ShutdownCoordinator, task::spawn_traced};
use pulse_error::{ErrorContext as _, GenericError};
use pulse_io::net::http::HttpSink;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{error, info, info_span, warn, Instrument as _};

use crate::config::AgentConfiguration;

// Upper bound on how long stopping the pipeline may take, including the emitter's final delivery.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// A validated pipeline that has not been started yet.
///
/// Everything that can fail without touching the network is checked here, so a builder that exists can be spawned
/// unless the statsd listener cannot be bound.
pub struct PipelineBuilder {
    checks_config: ChecksConfiguration,
    statsd_config: StatsdConfiguration,
    emitter_config: EmitterConfiguration,
    metrics_channel_size: usize,
    hostname: String,
    sink: HttpSink,
    registry: CheckRegistry,
}

impl PipelineBuilder {
    /// Validates every component configuration in `config` and builds the components that do not need a socket.
    ///
    /// # Errors
    ///
    /// If any component configuration is invalid or a named check is unknown, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let agent_config =
            AgentConfiguration::from_configuration(config).error_context("Invalid agent configuration.")?;
        let checks_config =
            ChecksConfiguration::from_configuration(config).error_context("Invalid checks configuration.")?;
        let statsd_config =
            StatsdConfiguration::from_configuration(config).error_context("Invalid statsd configuration.")?;
        let emitter_config =
            EmitterConfiguration::from_configuration(config).error_context("Invalid emitter configuration.")?;

        let hostname = agent_config.resolved_hostname();
        let sink = HttpSinkConfiguration::from_configuration(config)
            .error_context("Invalid HTTP sink configuration.")?
            .build(&hostname)?;
        let registry = CheckRegistry::from_builtin_names(&checks_config.checks)?;

        Ok(Self {
            checks_config,
            statsd_config,
            emitter_config,
            metrics_channel_size: agent_config.metrics_channel_size,
            hostname,
            sink,
            registry,
        })
    }

    /// Binds the statsd listener, if enabled, and spawns every component.
    ///
    /// Nothing is spawned unless the listener was bound.
    ///
    /// # Errors
    ///
    /// If the statsd listener cannot be bound, an error is returned.
    pub async fn spawn(self) -> Result<RunningPipeline, GenericError> {
        let Self {
            checks_config,
            statsd_config,
            emitter_config,
            metrics_channel_size,
            hostname,
            sink,
            registry,
        } = self;

        let statsd = if statsd_config.enabled {
            let source = statsd_config
                .build()
                .await
                .with_error_context(|| format!("Failed to bind statsd listener on {}.", statsd_config.listen_address))?;
            Some(source)
        } else {
            None
        };

        let coordinator = ShutdownCoordinator::new();
        let (metrics_tx, metrics_rx) = mpsc::channel(metrics_channel_size.max(1));

        let emitter = spawn_traced(
            Emitter::new(&emitter_config, sink)
                .run(metrics_rx, coordinator.register())
                .instrument(info_span!("emitter")),
        );

        let mut sources = Vec::new();
        if !registry.is_empty() {
            sources.extend(Scheduler::new(&checks_config, registry, metrics_tx.clone()).spawn(&coordinator));
        }
        if let Some(statsd) = statsd {
            sources.extend(statsd.spawn(&coordinator, metrics_tx));
        }

        info!(
            hostname = %hostname,
            checks = checks_config.checks.len(),
            statsd_enabled = statsd_config.enabled,
            "Pipeline running."
        );

        Ok(RunningPipeline {
            coordinator,
            sources,
            emitter,
        })
    }
}

/// A running set of sources feeding a single emitter.
pub struct RunningPipeline {
    coordinator: ShutdownCoordinator,
    sources: Vec<JoinHandle<()>>,
    emitter: JoinHandle<()>,
}

impl RunningPipeline {
    /// Builds every component from `config` and spawns them.
    ///
    /// # Errors
    ///
    /// If any component configuration is invalid, a named check is unknown, or the statsd listener cannot be bound, an
    /// error is returned.
    pub async fn spawn(config: &GenericConfiguration) -> Result<Self, GenericError> {
        PipelineBuilder::from_configuration(config)?.spawn().await
    }

    /// Replaces this pipeline with one built from `next`.
    ///
    /// An invalid `next` leaves this pipeline running untouched. If the new pipeline fails to start after this one has
    /// been stopped, a pipeline is started again from `current`. Returns the running pipeline and whether `next` was
    /// applied.
    ///
    /// # Errors
    ///
    /// If neither `next` nor `current` can be started, an error is returned and nothing is left running.
    pub async fn reload(
        self, current: &GenericConfiguration, next: &GenericConfiguration,
    ) -> Result<(Self, bool), GenericError> {
        let builder = match PipelineBuilder::from_configuration(next) {
            Ok(builder) => builder,
            Err(e) => {
                error!(error = ?e, "Invalid configuration. Keeping current pipeline.");
                return Ok((self, false));
            }
        };

        self.shutdown().await;
        match builder.spawn().await {
            Ok(pipeline) => Ok((pipeline, true)),
            Err(e) => {
                error!(error = ?e, "Failed to start reloaded pipeline. Restarting with previous configuration.");
                let pipeline = Self::spawn(current)
                    .await
                    .error_context("Failed to restart pipeline with previous configuration.")?;
                Ok((pipeline, false))
            }
        }
    }

    /// Signals every task to stop and waits for them to finish.
    ///
    /// Sources stop first. The emitter then drains whatever they flushed and makes a final delivery attempt.
    pub async fn shutdown(self) {
        info!("Stopping pipeline...");
        self.coordinator.shutdown();

        let Self { sources, emitter, .. } = self;
        let wait = async move {
            for handle in sources {
                if let Err(e) = handle.await {
                    error!(error = %e, "Source task failed.");
                }
            }
            if let Err(e) = emitter.await {
                error!(error = %e, "Emitter task failed.");
            }
        };

        match timeout(SHUTDOWN_TIMEOUT, wait).await {
            Ok(()) => info!("Pipeline stopped."),
            Err(_) => warn!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "Timed out waiting for the pipeline to stop."
            ),
        }
    }
}
