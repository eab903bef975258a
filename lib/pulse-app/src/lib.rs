//! High-level application primitives.
//!
//! This crate provides common primitives necessary for bootstrapping the agent prior to running, such as initializing
//! logging and internal telemetry.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod bootstrap;
pub mod logging;
pub mod metrics;

/// Common imports.
pub mod prelude {
    pub use super::bootstrap::update_pid_file;
    pub use super::logging::{fatal_and_exit, initialize_logging, set_panic_hook, LoggingConfiguration};
    pub use super::metrics::initialize_metrics;
}
