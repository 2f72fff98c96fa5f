//! Frame group collection.
//!
//! The [`FrameCollector`] sits between the transport and the consumer. It
//! maps the raw frames of incoming buffers onto the frame groups of the
//! active configuration and delivers each complete group on its own
//! conveyance thread.
//!
//! ```text
//! buffer_callback ──► slots[group][index] ──► conveyance queue ──► listener
//!  (acquisition)        (buffer lock)          (bounded)        (conveyance)
//! ```

mod conveyance;
mod frame;
mod frame_collector;
mod planner;
mod stats;

#[cfg(test)]
mod tests;

pub use conveyance::{CallbackData, CaptureMetadata, FrameCaptureListener};
pub use frame::RawFrame;
pub use frame_collector::{CollectorConfig, CollectorError, ExecutedConfiguration, FrameCollector};
pub use planner::{
    calculate_actions, collector_frame_groups, ActionPlan, BufferAction, BufferActionMap,
    CollectorFrameGroup, MapFramesTo, PlanError, TransmissionMode,
};
pub use stats::CollectorStats;
