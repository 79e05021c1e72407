//! Metrics module
//!
//! Exposes the work cache counters in Prometheus format.

mod exporter;

pub use exporter::WorkCacheExporter;
