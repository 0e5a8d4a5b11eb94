//! Telemetry sinks.
//!
//! Metric observation goes through an injected `MetricsSink` object rather
//! than process-wide registries, so tests substitute a recording sink and
//! embedding services plug in their own exporter. Only the label contract
//! is owned here.

use std::sync::Mutex;
use std::time::Duration;

/// Labels attached to publish-side observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishLabels {
    pub pin: String,
    pub message_type: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Labels attached to delivery-side observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryLabels {
    pub pin: String,
    pub message_type: String,
    pub queue: String,
}

/// Sink for bus telemetry.
pub trait MetricsSink: Send + Sync {
    /// One successful publish of `bytes` payload bytes.
    fn observe_publish(&self, labels: &PublishLabels, bytes: usize);

    /// One delivery of `bytes` payload bytes, handled in `elapsed`.
    fn observe_delivery(&self, labels: &DeliveryLabels, bytes: usize, elapsed: Duration);
}

/// Sink that drops every observation. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe_publish(&self, _labels: &PublishLabels, _bytes: usize) {}

    fn observe_delivery(&self, _labels: &DeliveryLabels, _bytes: usize, _elapsed: Duration) {}
}

/// Sink that records every observation, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    publishes: Mutex<Vec<(PublishLabels, usize)>>,
    deliveries: Mutex<Vec<(DeliveryLabels, usize, Duration)>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publishes(&self) -> Vec<(PublishLabels, usize)> {
        self.publishes.lock().unwrap().clone()
    }

    pub fn deliveries(&self) -> Vec<(DeliveryLabels, usize, Duration)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn publish_count(&self) -> usize {
        self.publishes.lock().unwrap().len()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

impl MetricsSink for RecordingMetrics {
    fn observe_publish(&self, labels: &PublishLabels, bytes: usize) {
        self.publishes.lock().unwrap().push((labels.clone(), bytes));
    }

    fn observe_delivery(&self, labels: &DeliveryLabels, bytes: usize, elapsed: Duration) {
        self.deliveries
            .lock()
            .unwrap()
            .push((labels.clone(), bytes, elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_captures_labels() {
        let sink = RecordingMetrics::new();
        let labels = PublishLabels {
            pin: "out".to_string(),
            message_type: "MESSAGE".to_string(),
            exchange: "demo".to_string(),
            routing_key: "key.out".to_string(),
        };
        sink.observe_publish(&labels, 42);
        sink.observe_publish(&labels, 7);

        let seen = sink.publishes();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, labels);
        assert_eq!(seen[0].1, 42);
        assert_eq!(seen[1].1, 7);
    }

    #[test]
    fn test_noop_sink_accepts_observations() {
        let sink = NoopMetrics;
        let labels = DeliveryLabels {
            pin: "in".to_string(),
            message_type: "MESSAGE".to_string(),
            queue: "q".to_string(),
        };
        sink.observe_delivery(&labels, 10, Duration::from_millis(1));
    }
}
