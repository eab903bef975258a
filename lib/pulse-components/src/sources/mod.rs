//! Sources.

pub mod checks;
pub mod statsd;
