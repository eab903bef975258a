//! Destinations.

mod emitter;
pub use self::emitter::{Emitter, EmitterConfiguration};

mod http;
pub use self::http::HttpSinkConfiguration;
