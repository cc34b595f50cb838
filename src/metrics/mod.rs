//! Metrics module
//!
//! Prometheus counters and histograms for mapping events.

mod reporter;

pub use reporter::MapReporter;
