//! Pipeline components: sampling sources and the delivery side of the pipeline.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod destinations;
pub mod sources;
