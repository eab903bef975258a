//! Decoders.

pub mod statsd;
