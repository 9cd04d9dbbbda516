//! Metrics collection for harness sessions.
//!
//! Provides Prometheus-compatible counters for publishes, deliveries and
//! callback failures so a failing test can dump what actually crossed the
//! wire.

pub mod prometheus;

pub use prometheus::HarnessMetrics;
