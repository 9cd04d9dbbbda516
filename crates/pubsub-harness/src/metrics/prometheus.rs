//! Prometheus metrics for the broker test harness.

use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::instance::LogicalPort;

/// Harness metrics collection.
///
/// Every metric is labeled with the protocol (logical port) it belongs to,
/// except callback panics which are counted per harness.
pub struct HarnessMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Publishes handed to a transport, by protocol.
    pub publishes_total: CounterVec,

    /// Publishes rejected locally or by the broker, by protocol.
    pub publish_failures_total: CounterVec,

    /// Messages delivered to subscription callbacks, by protocol.
    pub deliveries_total: CounterVec,

    /// Panics caught at the delivery callback boundary.
    pub callback_panics_total: IntCounter,

    /// Open sessions, by protocol.
    pub active_sessions: IntGaugeVec,

    /// Request/response latency of HTTP-based adapters, by protocol.
    pub request_duration_seconds: HistogramVec,
}

impl HarnessMetrics {
    /// Create a new metrics collection with its own registry.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let publishes_total = CounterVec::new(
            Opts::new(
                "pubsub_harness_publishes_total",
                "Total number of publishes handed to a transport by protocol",
            ),
            &["protocol"],
        )
        .expect("metric creation should succeed");

        let publish_failures_total = CounterVec::new(
            Opts::new(
                "pubsub_harness_publish_failures_total",
                "Total number of failed publishes by protocol",
            ),
            &["protocol"],
        )
        .expect("metric creation should succeed");

        let deliveries_total = CounterVec::new(
            Opts::new(
                "pubsub_harness_deliveries_total",
                "Total number of messages delivered to subscriptions by protocol",
            ),
            &["protocol"],
        )
        .expect("metric creation should succeed");

        let callback_panics_total = IntCounter::new(
            "pubsub_harness_callback_panics_total",
            "Total number of panics caught in delivery callbacks",
        )
        .expect("metric creation should succeed");

        let active_sessions = IntGaugeVec::new(
            Opts::new(
                "pubsub_harness_active_sessions",
                "Current number of open sessions by protocol",
            ),
            &["protocol"],
        )
        .expect("metric creation should succeed");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pubsub_harness_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
            &["protocol"],
        )
        .expect("metric creation should succeed");

        registry
            .register(Box::new(publishes_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(publish_failures_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(deliveries_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(callback_panics_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            publishes_total,
            publish_failures_total,
            deliveries_total,
            callback_panics_total,
            active_sessions,
            request_duration_seconds,
        }
    }

    /// Record a publish handed to the transport.
    pub fn record_publish(&self, protocol: LogicalPort) {
        self.publishes_total
            .with_label_values(&[protocol.name()])
            .inc();
    }

    /// Record a failed publish.
    pub fn record_publish_failure(&self, protocol: LogicalPort) {
        self.publish_failures_total
            .with_label_values(&[protocol.name()])
            .inc();
    }

    /// Record a delivery to a subscription callback.
    pub fn record_delivery(&self, protocol: LogicalPort) {
        self.deliveries_total
            .with_label_values(&[protocol.name()])
            .inc();
    }

    /// Record a panic caught in a callback.
    pub fn record_callback_panic(&self) {
        self.callback_panics_total.inc();
    }

    /// Record request latency.
    pub fn record_duration(&self, protocol: LogicalPort, duration_seconds: f64) {
        self.request_duration_seconds
            .with_label_values(&[protocol.name()])
            .observe(duration_seconds);
    }

    /// A session was opened.
    pub fn session_opened(&self, protocol: LogicalPort) {
        self.active_sessions
            .with_label_values(&[protocol.name()])
            .inc();
    }

    /// A session was closed.
    pub fn session_closed(&self, protocol: LogicalPort) {
        self.active_sessions
            .with_label_values(&[protocol.name()])
            .dec();
    }

    /// Current open session count for `protocol`.
    #[must_use]
    pub fn open_sessions(&self, protocol: LogicalPort) -> i64 {
        self.active_sessions
            .with_label_values(&[protocol.name()])
            .get()
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for HarnessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HarnessMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = HarnessMetrics::new();
        assert!(metrics.encode().is_ok());
    }

    #[test]
    fn test_record_publish_by_protocol() {
        let metrics = HarnessMetrics::new();
        metrics.record_publish(LogicalPort::Mqtt);
        metrics.record_publish(LogicalPort::Rest);
        metrics.record_publish_failure(LogicalPort::Rest);

        let output = metrics.encode().unwrap();
        assert!(output.contains("pubsub_harness_publishes_total{protocol=\"mqtt\"} 1"));
        assert!(output.contains("pubsub_harness_publish_failures_total{protocol=\"rest\"} 1"));
    }

    #[test]
    fn test_callback_panics_counter() {
        let metrics = HarnessMetrics::new();
        metrics.record_callback_panic();
        metrics.record_callback_panic();

        let output = metrics.encode().unwrap();
        assert!(output.contains("pubsub_harness_callback_panics_total 2"));
    }

    #[test]
    fn test_session_gauge() {
        let metrics = HarnessMetrics::new();
        metrics.session_opened(LogicalPort::Mqtt);
        metrics.session_opened(LogicalPort::Mqtt);
        metrics.session_closed(LogicalPort::Mqtt);

        assert_eq!(metrics.open_sessions(LogicalPort::Mqtt), 1);
        assert_eq!(metrics.open_sessions(LogicalPort::Rest), 0);
    }

    #[test]
    fn test_record_duration() {
        let metrics = HarnessMetrics::new();
        metrics.record_duration(LogicalPort::Management, 0.002);

        let output = metrics.encode().unwrap();
        assert!(output.contains("pubsub_harness_request_duration_seconds"));
    }
}
