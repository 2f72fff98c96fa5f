//! Prometheus metrics exporter for capture monitoring.
//!
//! Mirrors the collector and reassembler statistics in a Prometheus
//! registry, optionally served over HTTP.
//!
//! # Metrics Exposed
//!
//! ## Raw frames
//! - `tof_capture_raw_frames_total` - Raw frames accounted for
//! - `tof_capture_bridge_dropped_total` - Frames lost in the transport
//! - `tof_capture_collector_dropped_total` - Frames dropped by the collector
//!
//! ## Delivery
//! - `tof_capture_groups_delivered_total` - Frame groups delivered
//! - `tof_capture_consumer_failures_total` - Deliveries that panicked
//! - `tof_capture_queued_groups` - Groups waiting for the consumer
//!
//! ## Transport
//! - `tof_capture_acquiring` - Acquisition thread running
//! - `tof_capture_payloads_total` - Transport units processed
//! - `tof_capture_corrupt_frames_total` - Images discarded in reassembly
//! - `tof_capture_realignments_total` - Marker stream realignments
//! - `tof_capture_buffer_starvations_total` - No free buffer episodes
//! - `tof_capture_buffers_outstanding` - Buffers outside the pool
//!
//! # Example
//!
//! ```no_run
//! use tof_capture::metrics::{MetricsRegistry, MetricsSnapshot};
//!
//! let registry = MetricsRegistry::new().expect("Failed to create registry");
//! registry.update(&MetricsSnapshot {
//!     acquiring: true,
//!     raw_frames: 500,
//!     groups_delivered: 100,
//!     ..Default::default()
//! });
//! println!("{}", registry.encode().unwrap());
//! ```

mod registry;
#[cfg(feature = "metrics")]
mod server;

pub use registry::{MetricsError, MetricsRegistry, MetricsSnapshot};
#[cfg(feature = "metrics")]
pub use server::{CaptureHealth, MetricsServer, MetricsServerConfig, MetricsState, ServerError};
