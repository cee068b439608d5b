//! Throughput and connection statistics

pub mod metrics;

pub use metrics::{ServerStats, ThroughputStats};
