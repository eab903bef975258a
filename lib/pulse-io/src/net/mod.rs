//! Network primitives.

pub mod http;
pub mod udp;
