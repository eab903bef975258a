//! Encoders.

pub mod payload;
