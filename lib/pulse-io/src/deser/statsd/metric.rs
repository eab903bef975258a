use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::i64 as parse_i64,
    combinator::all_consuming,
    number::complete::double,
    sequence::{preceded, terminated},
    Parser as _,
};
use pulse_core::metric::{Metric, MetricType};

use super::{helpers::*, ParseError, StatsdCodecConfiguration};

const HOST_TAG_PREFIX: &str = "host:";
const DEVICE_TAG_PREFIX: &str = "device:";

/// A decoded statsd line, before its value groups have been parsed.
pub struct StatsdLine<'a> {
    /// Metric name shared by every value group on the line.
    pub metric_name: &'a str,

    groups: Vec<&'a [u8]>,
}

impl<'a> StatsdLine<'a> {
    /// Parses each value group into a metric.
    ///
    /// Groups are parsed independently, so a malformed group does not affect the others.
    pub fn metrics<'c>(
        &'c self, config: &'c StatsdCodecConfiguration,
    ) -> impl Iterator<Item = Result<Metric, ParseError>> + 'c {
        self.groups
            .iter()
            .map(move |group| parse_value_group(self.metric_name, group, config))
    }
}

/// Splits a single statsd line into its metric name and value groups.
///
/// # Errors
///
/// If the line has no valid metric name, or no `:` separator after it, an error is returned.
pub fn parse_statsd_line<'a>(input: &'a [u8], config: &StatsdCodecConfiguration) -> Result<StatsdLine<'a>, ParseError> {
    let metric_name_parser = if config.permissive {
        permissive_metric_name
    } else {
        ascii_alphanum_and_seps
    };
    let (body, metric_name) = terminated(metric_name_parser, tag(":")).parse(input)?;

    Ok(StatsdLine {
        metric_name,
        groups: split_value_groups(body),
    })
}

fn parse_value_group(metric_name: &str, input: &[u8], config: &StatsdCodecConfiguration) -> Result<Metric, ParseError> {
    let (remaining, raw_value) = terminated(take_while1(|b| b != b'|'), tag("|")).parse(input)?;
    let (_, value) = finite_value(raw_value)?;
    let (remaining, metric_type) = metric_type(remaining)?;

    let mut metric = Metric::new(metric_name, metric_type).with_value(value);

    if !remaining.is_empty() {
        let (mut remaining, _) = tag("|").parse(remaining)?;

        while let Some((chunk, tail)) = split_at_delimiter(remaining, b'|') {
            if chunk.is_empty() {
                break;
            }

            match chunk[0] {
                // Sample rate: fraction of events this sample represents.
                b'@' => {
                    let (_, sample_rate) = all_consuming(preceded(tag("@"), double)).parse(chunk)?;
                    if !(0.0..=1.0).contains(&sample_rate) {
                        return Err(ParseError::InvalidSampleRate {
                            metric_name: metric_name.to_string(),
                            sample_rate,
                        });
                    }
                    metric.sample_rate = sample_rate;
                }
                // Tags: comma-separated.
                b'#' => {
                    let raw_tags = utf8(&chunk[1..])?;
                    apply_tags(&mut metric, raw_tags, config);
                }
                // Timestamp: seconds since the Unix epoch.
                b'T' => {
                    if config.timestamps {
                        let (_, timestamp) = all_consuming(preceded(tag("T"), parse_i64)).parse(chunk)?;
                        metric.timestamp = Some(timestamp);
                    }
                }
                // Unknown extensions are skipped.
                _ => {}
            }

            remaining = tail;
        }
    }

    // Sets are always counted once per distinct value, regardless of sampling.
    if metric_type == MetricType::Set {
        metric.sample_rate = 1.0;
    }

    Ok(metric)
}

fn apply_tags(metric: &mut Metric, raw_tags: &str, config: &StatsdCodecConfiguration) {
    for tag in raw_tags.split(',').filter(|tag| !tag.is_empty()) {
        if let Some(hostname) = tag.strip_prefix(HOST_TAG_PREFIX) {
            metric.hostname = hostname.to_string();
        } else if let Some(device_name) = tag.strip_prefix(DEVICE_TAG_PREFIX) {
            metric.device_name = device_name.to_string();
        } else if metric.tags.len() < config.maximum_tag_count {
            metric.tags.insert(tag.to_string());
        }
    }
}
