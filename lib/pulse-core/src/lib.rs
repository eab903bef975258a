//! Core primitives for the metrics pipeline: the metric model, aggregation state machines, bounded buffering, and
//! runtime helpers shared by every component.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod aggregate;
pub mod buffer;
pub mod metric;
pub mod observability;
pub mod runtime;
pub mod task;
pub mod time;

/// A hash map based on `hashbrown` using `foldhash` for fast, non-cryptographic hashing.
pub type FastHashMap<K, V> = hashbrown::HashMap<K, V, foldhash::fast::RandomState>;

/// A hash set based on `hashbrown` using `foldhash` for fast, non-cryptographic hashing.
pub type FastHashSet<T> = hashbrown::HashSet<T, foldhash::fast::RandomState>;
