//! Internal observability.

pub mod metrics;
