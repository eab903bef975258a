//! Statsd wire protocol.
//!
//! Packets are newline-delimited lines of the form `name:value|type[|@rate][|#tag1,tag2][|T<timestamp>]`, where type
//! is one of `c` (counter), `g` (gauge), `s` (set), or `ms`/`h` (histogram). A line may also pack several value
//! groups under one name (`name:1|c:2|c|#env:prod`), which decodes identically to the equivalent separate lines.

use pulse_core::metric::Metric;
use snafu::Snafu;
use tracing::warn;

mod helpers;
use self::helpers::split_at_delimiter;

mod metric;
pub use self::metric::{parse_statsd_line, StatsdLine};

type NomParserError<'a> = nom::Err<nom::error::Error<&'a [u8]>>;

/// A statsd parse error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ParseError {
    /// The input did not match the expected structure.
    #[snafu(display("encountered error '{:?}' while processing message '{}'", kind, data))]
    Structural {
        /// Parser error kind.
        kind: nom::error::ErrorKind,

        /// Input remaining at the point of failure.
        data: String,
    },

    /// The sample rate was outside of `[0, 1]`.
    #[snafu(display("sample rate {} for metric '{}' is outside of [0, 1]", sample_rate, metric_name))]
    InvalidSampleRate {
        /// Metric name.
        metric_name: String,

        /// Rejected sample rate.
        sample_rate: f64,
    },
}

impl<'a> From<NomParserError<'a>> for ParseError {
    fn from(err: NomParserError<'a>) -> Self {
        match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => ParseError::Structural {
                kind: e.code,
                data: String::from_utf8_lossy(e.input).to_string(),
            },
            nom::Err::Incomplete(_) => ParseError::Structural {
                kind: nom::error::ErrorKind::Eof,
                data: String::new(),
            },
        }
    }
}

/// Statsd codec configuration.
#[derive(Clone, Debug)]
pub struct StatsdCodecConfiguration {
    permissive: bool,
    maximum_tag_count: usize,
    timestamps: bool,
}

impl StatsdCodecConfiguration {
    /// Sets whether metric names may contain any printable ASCII character rather than only alphanumerics and `._- `.
    ///
    /// Defaults to `false`.
    pub fn with_permissive_mode(mut self, permissive: bool) -> Self {
        self.permissive = permissive;
        self
    }

    /// Sets the maximum number of tags kept per metric. Extra tags are discarded.
    ///
    /// Defaults to no limit.
    pub fn with_maximum_tag_count(mut self, maximum_tag_count: usize) -> Self {
        self.maximum_tag_count = maximum_tag_count;
        self
    }

    /// Sets whether client-provided timestamps are honored.
    ///
    /// Defaults to `true`.
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }
}

impl Default for StatsdCodecConfiguration {
    fn default() -> Self {
        Self {
            permissive: false,
            maximum_tag_count: usize::MAX,
            timestamps: true,
        }
    }
}

/// Outcome of decoding a packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DecodeSummary {
    /// Number of metrics decoded.
    pub decoded: usize,

    /// Number of lines or value groups rejected.
    pub rejected: usize,
}

/// Decodes statsd packets into metrics.
#[derive(Clone, Debug, Default)]
pub struct StatsdDecoder {
    config: StatsdCodecConfiguration,
}

impl StatsdDecoder {
    /// Creates a new `StatsdDecoder` with the given configuration.
    pub fn new(config: StatsdCodecConfiguration) -> Self {
        Self { config }
    }

    /// Decodes every line in `packet`, appending decoded metrics to `out`.
    ///
    /// Malformed lines, and malformed value groups within a line, are logged and skipped. The rest of the packet is
    /// still decoded.
    pub fn decode_packet(&self, packet: &[u8], out: &mut Vec<Metric>) -> DecodeSummary {
        let mut summary = DecodeSummary::default();
        let mut remaining = packet;

        while let Some((line, tail)) = split_at_delimiter(remaining, b'\n') {
            remaining = tail;

            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }

            let parsed = match parse_statsd_line(line, &self.config) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, line = %String::from_utf8_lossy(line), "Failed to parse statsd line.");
                    summary.rejected += 1;
                    continue;
                }
            };

            for result in parsed.metrics(&self.config) {
                match result {
                    Ok(metric) => {
                        out.push(metric);
                        summary.decoded += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, metric_name = parsed.metric_name, "Failed to parse statsd value.");
                        summary.rejected += 1;
                    }
                }
            }
        }

        summary
    }
}
