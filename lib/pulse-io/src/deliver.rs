//! Delivery of metric batches to a collector.

use async_trait::async_trait;
use pulse_core::metric::Metric;
use snafu::Snafu;

/// A delivery error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum DeliveryError {
    /// The batch could not be encoded.
    #[snafu(display("Failed to encode payload."))]
    Encode {
        /// Error source.
        source: serde_json::Error,
    },

    /// The request could not be sent, or no response was received.
    #[snafu(display("Failed to send payload."))]
    Transport {
        /// Error source.
        source: reqwest::Error,
    },

    /// The collector responded, but did not accept the batch.
    #[snafu(display("Collector rejected payload with status {}.", status))]
    Rejected {
        /// Response status code.
        status: u16,
    },
}

/// Delivers batches of metrics.
///
/// Implementations treat a batch as a single unit: either the whole batch is accepted or the call fails and the caller
/// keeps ownership of the batch for a later retry.
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Delivers a batch.
    ///
    /// # Errors
    ///
    /// If the batch was not accepted, an error is returned.
    async fn deliver(&self, batch: &[Metric]) -> Result<(), DeliveryError>;
}
