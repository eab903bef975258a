//! HTTP delivery.

use std::time::Duration;

use async_trait::async_trait;
use pulse_core::{metric::Metric, time::get_unix_timestamp};
use pulse_error::{ErrorContext as _, GenericError};
use reqwest::{header::CONTENT_TYPE, Client};
use snafu::ResultExt as _;
use tracing::{debug, trace};

use crate::{
    deliver::{Deliver, DeliveryError, Encode, Transport},
    ser::payload::{encode_payload, PayloadHeader},
};

/// Delivers batches as JSON payloads over HTTP `POST`.
///
/// Any non-2xx response is treated as a failed delivery.
pub struct HttpSink {
    client: Client,
    url: String,
    header: PayloadHeader,
}

impl HttpSink {
    /// Creates a new `HttpSink` that posts to `url`.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be built, an error is returned.
    pub fn new(url: String, header: PayloadHeader, request_timeout: Duration) -> Result<Self, GenericError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(format!("pulse-agent/{}", header.agent_version))
            .build()
            .error_context("Failed to build HTTP client.")?;

        Ok(Self { client, url, header })
    }
}

#[async_trait]
impl Deliver for HttpSink {
    async fn deliver(&self, batch: &[Metric]) -> Result<(), DeliveryError> {
        let body = encode_payload(&self.header, batch, get_unix_timestamp()).context(Encode)?;
        trace!(metrics = batch.len(), payload_len = body.len(), "Sending payload.");

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .context(Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }

        debug!(metrics = batch.len(), status = status.as_u16(), "Delivered payload.");
        Ok(())
    }
}
