//! Pulse agent.
//!
//! Runs the built-in checks and a statsd listener, aggregates what they produce, and delivers the results to a
//! collector over HTTP.

#![deny(warnings)]
#![deny(missing_docs)]
use std::{path::PathBuf, time::Instant};

use clap::Parser as _;
use pulse_app::prelude::*;
use pulse_config::GenericConfiguration;
use pulse_error::{ErrorContext as _, GenericError};
use tracing::{error, info};

mod config;
use self::config::{load_configuration, Action, AgentConfiguration, Cli, RunConfig};

mod pipeline;
use self::pipeline::RunningPipeline;

mod signals;
use self::signals::{AgentSignal, Signals};

#[tokio::main]
async fn main() {
    let started = Instant::now();
    let cli = Cli::parse();

    let run_config = match cli.action {
        Some(Action::Run(config)) => config,
        // If no subcommand is provided, the run subcommand is executed with the default configuration.
        None => RunConfig::default(),
    };

    let configuration = load_configuration(&run_config.config).unwrap_or_else(|e| {
        fatal_and_exit(format!("failed to load configuration: {:?}", e));
        unreachable!()
    });

    let logging_config = LoggingConfiguration::from_configuration(&configuration).unwrap_or_else(|e| {
        fatal_and_exit(format!("invalid logging configuration: {:?}", e));
        unreachable!()
    });
    let _guard = initialize_logging(&logging_config).unwrap_or_else(|e| {
        fatal_and_exit(format!("failed to initialize logging: {:?}", e));
        unreachable!()
    });
    set_panic_hook();

    if let Err(e) = initialize_metrics("pulse").await {
        fatal_and_exit(format!("failed to initialize metrics: {:?}", e));
    }

    match run(started, run_config.config, configuration).await {
        Ok(()) => info!("Pulse agent stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(started: Instant, config_path: PathBuf, configuration: GenericConfiguration) -> Result<(), GenericError> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        process_id = std::process::id(),
        config_path = %config_path.display(),
        "Pulse agent starting..."
    );

    let agent_config = AgentConfiguration::from_configuration(&configuration)?;
    if let Some(pid_file) = &agent_config.pid_file {
        update_pid_file(pid_file).with_error_context(|| format!("Failed to write PID file '{}'.", pid_file.display()))?;
    }

    let mut signals = Signals::new()?;
    let mut pipeline = RunningPipeline::spawn(&configuration).await?;
    let mut current = configuration;

    info!(
        init_time_ms = started.elapsed().as_millis(),
        "Pulse agent running. Waiting for signal..."
    );

    loop {
        match signals.recv().await {
            AgentSignal::Shutdown => {
                info!("Received shutdown signal. Shutting down...");
                break;
            }
            AgentSignal::Reload => {
                info!("Received reload signal. Reloading configuration...");

                // A broken file leaves the current pipeline untouched.
                let configuration = match load_configuration(&config_path) {
                    Ok(configuration) => configuration,
                    Err(e) => {
                        error!(error = ?e, "Failed to reload configuration. Keeping current pipeline.");
                        continue;
                    }
                };

                let reloaded_at = Instant::now();
                let (reloaded, applied) = pipeline.reload(&current, &configuration).await?;
                pipeline = reloaded;
                if applied {
                    current = configuration;
                    info!(
                        reload_time_ms = reloaded_at.elapsed().as_millis(),
                        "Pipeline rebuilt."
                    );
                }
            }
        }
    }

    pipeline.shutdown().await;
    Ok(())
}
