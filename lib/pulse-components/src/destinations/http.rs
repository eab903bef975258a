use std::time::Duration;

use pulse_config::GenericConfiguration;
use pulse_error::GenericError;
use pulse_io::{net::http::HttpSink, ser::payload::PayloadHeader};
use serde::Deserialize;

const fn default_request_timeout_secs() -> u64 {
    10
}

/// HTTP sink configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct HttpSinkConfiguration {
    /// Collector endpoint that payloads are posted to.
    pub collector_url: String,

    /// License key sent with every payload.
    pub license_key: String,

    /// Per-request timeout, in seconds.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl HttpSinkConfiguration {
    /// Creates a new `HttpSinkConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If `collector_url` or `license_key` is missing, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(Self {
            collector_url: config.get_typed("collector_url")?,
            license_key: config.get_typed("license_key")?,
            request_timeout_secs: config
                .try_get_typed("request_timeout_secs")?
                .unwrap_or_else(default_request_timeout_secs),
        })
    }

    /// Builds the sink, identifying the agent as `hostname`.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be built, an error is returned.
    pub fn build(&self, hostname: &str) -> Result<HttpSink, GenericError> {
        let header = PayloadHeader {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            internal_hostname: hostname.to_string(),
            license_key: self.license_key.clone(),
        };

        HttpSink::new(
            self.collector_url.clone(),
            header,
            Duration::from_secs(self.request_timeout_secs),
        )
    }
}
