//! Runtime primitives.

mod shutdown;
pub use self::shutdown::{ShutdownCoordinator, ShutdownSignal};
