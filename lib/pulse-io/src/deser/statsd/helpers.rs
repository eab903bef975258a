use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    combinator::{all_consuming, map, verify},
    error::{Error, ErrorKind},
    number::complete::double,
    IResult, Parser as _,
};
use pulse_core::metric::MetricType;

#[inline]
pub fn split_at_delimiter(input: &[u8], delimiter: u8) -> Option<(&[u8], &[u8])> {
    match memchr::memchr(delimiter, input) {
        Some(index) => Some((&input[0..index], &input[index + 1..input.len()])),
        None => {
            if input.is_empty() {
                None
            } else {
                Some((input, &[]))
            }
        }
    }
}

#[inline]
pub fn utf8(input: &[u8]) -> Result<&str, nom::Err<Error<&[u8]>>> {
    simdutf8::basic::from_utf8(input).map_err(|_| nom::Err::Error(Error::new(input, ErrorKind::Verify)))
}

#[inline]
pub fn ascii_alphanum_and_seps(input: &[u8]) -> IResult<&[u8], &str> {
    let valid_char = |c: u8| c.is_ascii_alphanumeric() || c == b' ' || c == b'_' || c == b'-' || c == b'.';
    map(take_while1(valid_char), |b| {
        // SAFETY: `b` only contains ASCII characters, which are valid UTF-8.
        unsafe { std::str::from_utf8_unchecked(b) }
    })
    .parse(input)
}

#[inline]
pub fn permissive_metric_name(input: &[u8]) -> IResult<&[u8], &str> {
    // Any printable ASCII character other than `:`.
    let valid_char = |c: u8| c > 31 && c < 127 && c != b':';
    map(take_while1(valid_char), |b| {
        // SAFETY: `b` only contains ASCII characters, which are valid UTF-8.
        unsafe { std::str::from_utf8_unchecked(b) }
    })
    .parse(input)
}

/// Parses a complete, finite floating-point value.
#[inline]
pub fn finite_value(input: &[u8]) -> IResult<&[u8], f64> {
    all_consuming(verify(double, |value: &f64| value.is_finite())).parse(input)
}

/// Parses a metric type token.
///
/// The token must be followed by a modifier (`|`), another value group (`:`), or the end of input, so that `s` does
/// not match the start of some longer word.
#[inline]
pub fn metric_type(input: &[u8]) -> IResult<&[u8], MetricType> {
    let (remaining, raw_kind) = alt((tag("ms"), tag("c"), tag("g"), tag("h"), tag("s"))).parse(input)?;
    if !matches!(remaining.first(), None | Some(b'|') | Some(b':')) {
        return Err(nom::Err::Error(Error::new(input, ErrorKind::Tag)));
    }

    let metric_type = match raw_kind {
        b"c" => MetricType::Counter,
        b"g" => MetricType::BucketGauge,
        b"s" => MetricType::Set,
        b"ms" | b"h" => MetricType::Histogram,
        _ => unreachable!("should be constrained by alt parser"),
    };

    Ok((remaining, metric_type))
}

/// Returns `true` if `input` begins with a `<value>|<type>` group.
pub fn starts_value_group(input: &[u8]) -> bool {
    let Some(pipe) = memchr::memchr(b'|', input) else {
        return false;
    };

    finite_value(&input[..pipe]).is_ok() && metric_type(&input[pipe + 1..]).is_ok()
}

/// Splits the portion of a line after the metric name into value groups.
///
/// Groups are separated by `:`, but only where the text after the colon itself looks like the start of a group.
/// Colons anywhere else, such as inside `key:value` tags, stay part of the current group.
pub fn split_value_groups(body: &[u8]) -> Vec<&[u8]> {
    let mut groups = Vec::new();
    let mut group_start = 0;

    for colon in memchr::memchr_iter(b':', body) {
        if starts_value_group(&body[colon + 1..]) {
            groups.push(&body[group_start..colon]);
            group_start = colon + 1;
        }
    }
    groups.push(&body[group_start..]);

    groups
}
