//! I/O for the metrics pipeline: wire protocol decoding, network listeners, payload encoding, and delivery.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod deliver;
pub mod deser;
pub mod net;
pub mod ser;
