//! Latency probe daemon library
//!
//! Reusable components for loading the eBPF object, collecting and
//! aggregating latency events, and exporting metrics.

pub mod collector;
pub mod config;
pub mod error;
pub mod events;
pub mod exporter;
pub mod loader;
pub mod types;

pub use collector::Aggregate;
pub use config::Config;
pub use error::{ExitCode, ProbeError};
pub use events::EventProcessor;
pub use exporter::{ExporterType, InfluxExporter, JsonExporter, MetricsExporter, PrometheusExporter};
pub use loader::{AttachResult, ProbeLoader};
pub use types::*;
