use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use pulse_config::{ConfigurationLoader, GenericConfiguration};
use pulse_error::{ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing::debug;

/// Configuration file read when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pulse/pulse.yaml";

const ENV_PREFIX: &str = "PULSE";

const fn default_metrics_channel_size() -> usize {
    1024
}

#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Subcommand)]
pub enum Action {
    /// Runs the agent.
    Run(RunConfig),
}

/// Run subcommand configuration.
#[derive(Args, Clone, Debug)]
pub struct RunConfig {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }
}

/// Loads the configuration file at `path`, with `PULSE_`-prefixed environment variables layered on top.
///
/// A missing or unreadable file is not an error: every setting can also come from the environment.
pub fn load_configuration(path: &Path) -> Result<GenericConfiguration, GenericError> {
    let loader = ConfigurationLoader::default()
        .try_from_yaml(path)
        .from_environment(ENV_PREFIX)
        .error_context("Failed to load configuration from the environment.")?;

    Ok(loader.into_generic())
}

/// Agent-wide settings that do not belong to any single component.
#[derive(Clone, Debug, Deserialize)]
pub struct AgentConfiguration {
    /// Hostname reported with every payload.
    ///
    /// Defaults to the operating system hostname.
    #[serde(default)]
    pub hostname: Option<String>,

    /// File to write the process ID to at startup.
    ///
    /// Defaults to unset.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    /// Capacity, in batches, of the channel between the sources and the emitter.
    ///
    /// Defaults to 1024.
    #[serde(default = "default_metrics_channel_size")]
    pub metrics_channel_size: usize,
}

impl AgentConfiguration {
    /// Creates a new `AgentConfiguration` from the given configuration.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Returns the configured hostname, falling back to the operating system hostname and then `localhost`.
    pub fn resolved_hostname(&self) -> String {
        if let Some(hostname) = self.hostname.as_deref().filter(|h| !h.is_empty()) {
            return hostname.to_string();
        }

        match hostname::get() {
            Ok(hostname) => hostname.to_string_lossy().into_owned(),
            Err(e) => {
                debug!(error = %e, "Failed to query hostname. Using 'localhost'.");
                "localhost".to_string()
            }
        }
    }
}
