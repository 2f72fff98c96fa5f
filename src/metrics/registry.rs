//! Metrics collection and registry.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// A snapshot of capture state for metrics update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Whether the acquisition thread is running.
    pub acquiring: bool,
    /// Raw frames accounted for since the last configuration.
    pub raw_frames: u64,
    /// Raw frames lost before reaching the collector.
    pub bridge_dropped: u64,
    /// Raw frames the collector received but never delivered.
    pub collector_dropped: u64,
    /// Frame groups handed to the consumer.
    pub groups_delivered: u64,
    /// Frame groups whose delivery panicked.
    pub consumer_failures: u64,
    /// Frame groups waiting for the consumer.
    pub queued_groups: usize,
    /// Transport units processed.
    pub payloads: u64,
    /// Images discarded during reassembly.
    pub corrupt_frames: u64,
    /// Marker stream realignments.
    pub realignments: u64,
    /// Times no capture buffer was free.
    pub buffer_starvations: u64,
    /// Capture buffers currently outside the pool.
    pub buffers_outstanding: usize,
}

/// Prometheus metrics registry for the capture path.
pub struct MetricsRegistry {
    registry: Registry,

    acquiring: IntGauge,

    // Raw frame accounting
    raw_frames_total: IntCounter,
    bridge_dropped_total: IntCounter,
    collector_dropped_total: IntCounter,

    // Delivery
    groups_delivered_total: IntCounter,
    consumer_failures_total: IntCounter,
    queued_groups: IntGauge,

    // Transport
    payloads_total: IntCounter,
    corrupt_frames_total: IntCounter,
    realignments_total: IntCounter,
    buffer_starvations_total: IntCounter,
    buffers_outstanding: IntGauge,
}

fn advance(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl MetricsRegistry {
    /// Creates a new metrics registry with all capture metrics registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let acquiring = IntGauge::new("tof_capture_acquiring", "Acquisition thread running (1) or stopped (0)")?;

        let raw_frames_total = IntCounter::new(
            "tof_capture_raw_frames_total",
            "Raw frames accounted for: delivered or dropped",
        )?;
        let bridge_dropped_total = IntCounter::new(
            "tof_capture_bridge_dropped_total",
            "Raw frames lost before reaching the collector",
        )?;
        let collector_dropped_total = IntCounter::new(
            "tof_capture_collector_dropped_total",
            "Raw frames received by the collector but never delivered",
        )?;

        let groups_delivered_total = IntCounter::new(
            "tof_capture_groups_delivered_total",
            "Frame groups handed to the consumer",
        )?;
        let consumer_failures_total = IntCounter::new(
            "tof_capture_consumer_failures_total",
            "Frame group deliveries that panicked in the consumer",
        )?;
        let queued_groups = IntGauge::new("tof_capture_queued_groups", "Frame groups waiting for the consumer")?;

        let payloads_total = IntCounter::new("tof_capture_payloads_total", "Transport units processed")?;
        let corrupt_frames_total = IntCounter::new(
            "tof_capture_corrupt_frames_total",
            "Images discarded during payload reassembly",
        )?;
        let realignments_total = IntCounter::new(
            "tof_capture_realignments_total",
            "Marker-framed stream realignments",
        )?;
        let buffer_starvations_total = IntCounter::new(
            "tof_capture_buffer_starvations_total",
            "Times the acquisition thread found no free buffer",
        )?;
        let buffers_outstanding = IntGauge::new(
            "tof_capture_buffers_outstanding",
            "Capture buffers currently held outside the pool",
        )?;

        registry.register(Box::new(acquiring.clone()))?;
        registry.register(Box::new(raw_frames_total.clone()))?;
        registry.register(Box::new(bridge_dropped_total.clone()))?;
        registry.register(Box::new(collector_dropped_total.clone()))?;
        registry.register(Box::new(groups_delivered_total.clone()))?;
        registry.register(Box::new(consumer_failures_total.clone()))?;
        registry.register(Box::new(queued_groups.clone()))?;
        registry.register(Box::new(payloads_total.clone()))?;
        registry.register(Box::new(corrupt_frames_total.clone()))?;
        registry.register(Box::new(realignments_total.clone()))?;
        registry.register(Box::new(buffer_starvations_total.clone()))?;
        registry.register(Box::new(buffers_outstanding.clone()))?;

        Ok(Self {
            registry,
            acquiring,
            raw_frames_total,
            bridge_dropped_total,
            collector_dropped_total,
            groups_delivered_total,
            consumer_failures_total,
            queued_groups,
            payloads_total,
            corrupt_frames_total,
            realignments_total,
            buffer_starvations_total,
            buffers_outstanding,
        })
    }

    /// Updates all metrics from a snapshot.
    ///
    /// Counters only move forward: a snapshot taken after a reconfiguration
    /// reset its source counters leaves them where they were.
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        self.acquiring.set(i64::from(snapshot.acquiring));

        advance(&self.raw_frames_total, snapshot.raw_frames);
        advance(&self.bridge_dropped_total, snapshot.bridge_dropped);
        advance(&self.collector_dropped_total, snapshot.collector_dropped);

        advance(&self.groups_delivered_total, snapshot.groups_delivered);
        advance(&self.consumer_failures_total, snapshot.consumer_failures);
        self.queued_groups.set(snapshot.queued_groups as i64);

        advance(&self.payloads_total, snapshot.payloads);
        advance(&self.corrupt_frames_total, snapshot.corrupt_frames);
        advance(&self.realignments_total, snapshot.realignments);
        advance(&self.buffer_starvations_total, snapshot.buffer_starvations);
        self.buffers_outstanding.set(snapshot.buffers_outstanding as i64);
    }

    /// Returns the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        assert!(MetricsRegistry::new().is_ok());
    }

    #[test]
    fn test_metrics_update() {
        let registry = MetricsRegistry::new().unwrap();

        registry.update(&MetricsSnapshot {
            acquiring: true,
            raw_frames: 50,
            bridge_dropped: 5,
            groups_delivered: 9,
            realignments: 1,
            buffers_outstanding: 3,
            ..Default::default()
        });

        let output = registry.encode().unwrap();
        assert!(output.contains("tof_capture_acquiring 1"));
        assert!(output.contains("tof_capture_raw_frames_total 50"));
        assert!(output.contains("tof_capture_bridge_dropped_total 5"));
        assert!(output.contains("tof_capture_groups_delivered_total 9"));
        assert!(output.contains("tof_capture_realignments_total 1"));
        assert!(output.contains("tof_capture_buffers_outstanding 3"));
    }

    #[test]
    fn test_counters_do_not_go_backwards() {
        let registry = MetricsRegistry::new().unwrap();
        registry.update(&MetricsSnapshot {
            raw_frames: 40,
            ..Default::default()
        });
        registry.update(&MetricsSnapshot {
            raw_frames: 10,
            ..Default::default()
        });
        assert!(registry.encode().unwrap().contains("tof_capture_raw_frames_total 40"));
    }
}
