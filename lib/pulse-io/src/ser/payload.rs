//! Collector payload encoding.
//!
//! A payload is a JSON object:
//!
//! ```json
//! {
//!   "agentVersion": "0.1.0",
//!   "collection_timestamp": 1700000000,
//!   "internalHostname": "web-01",
//!   "licenseKey": "...",
//!   "metrics": [["requests", 1700000000, 20.0, {"tags": ["env:prod"], "type": "counter"}]],
//!   "uuid": "...",
//!   "service_checks": []
//! }
//! ```
//!
//! The trailing attribute object of each metric entry is only present when it has at least one attribute. Gauges omit
//! `type`, as gauge is the collector's default.

use pulse_core::metric::{Metric, MetricType};
use serde::{ser::SerializeSeq as _, Serialize, Serializer};

/// Identity of the agent sending a payload.
#[derive(Clone, Debug)]
pub struct PayloadHeader {
    /// Agent version.
    pub agent_version: String,

    /// Hostname of the machine the agent runs on.
    pub internal_hostname: String,

    /// Collector license key.
    pub license_key: String,
}

#[derive(Serialize)]
struct Payload<'a> {
    #[serde(rename = "agentVersion")]
    agent_version: &'a str,
    collection_timestamp: i64,
    #[serde(rename = "internalHostname")]
    internal_hostname: &'a str,
    #[serde(rename = "licenseKey")]
    license_key: &'a str,
    metrics: Vec<MetricEntry<'a>>,
    uuid: String,
    service_checks: [(); 0],
}

struct MetricEntry<'a>(&'a Metric, i64);

#[derive(Serialize)]
struct Attributes<'a> {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<&'a str>,
    #[serde(skip_serializing_if = "str_is_empty")]
    hostname: &'a str,
    #[serde(skip_serializing_if = "str_is_empty")]
    device_name: &'a str,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    metric_type: Option<&'static str>,
}

fn str_is_empty(value: &&str) -> bool {
    value.is_empty()
}

impl Attributes<'_> {
    fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.hostname.is_empty() && self.device_name.is_empty() && self.metric_type.is_none()
    }
}

impl Serialize for MetricEntry<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let MetricEntry(metric, collection_timestamp) = self;

        let attributes = Attributes {
            tags: metric.tags.iter().map(String::as_str).collect(),
            hostname: &metric.hostname,
            device_name: &metric.device_name,
            metric_type: match metric.metric_type {
                MetricType::Gauge | MetricType::BucketGauge => None,
                other => Some(other.as_str()),
            },
        };

        let len = if attributes.is_empty() { 3 } else { 4 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&metric.name)?;
        seq.serialize_element(&metric.timestamp.unwrap_or(*collection_timestamp))?;
        seq.serialize_element(&metric.value.unwrap_or_default())?;
        if !attributes.is_empty() {
            seq.serialize_element(&attributes)?;
        }
        seq.end()
    }
}

/// Encodes a batch of metrics as a JSON payload.
///
/// Metrics without a timestamp are stamped with `collection_timestamp`.
///
/// # Errors
///
/// If serialization fails, an error is returned.
pub fn encode_payload(
    header: &PayloadHeader, batch: &[Metric], collection_timestamp: i64,
) -> Result<Vec<u8>, serde_json::Error> {
    let payload = Payload {
        agent_version: &header.agent_version,
        collection_timestamp,
        internal_hostname: &header.internal_hostname,
        license_key: &header.license_key,
        metrics: batch
            .iter()
            .map(|metric| MetricEntry(metric, collection_timestamp))
            .collect(),
        uuid: uuid::Uuid::new_v4().to_string(),
        service_checks: [],
    };

    serde_json::to_vec(&payload)
}
