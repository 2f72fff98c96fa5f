//! Time-of-Flight Camera Capture Library
//!
//! The real-time path between a ToF camera's transport and the depth
//! processing that consumes its raw frames. Images arriving in transport
//! pieces are reassembled into whole buffers, the raw frames inside those
//! buffers are sorted into frame groups, and each complete group is handed
//! to a consumer on its own thread.
//!
//! # Architecture
//!
//! The system follows an explicit data flow:
//!
//! ```text
//! PayloadSource → transport (reassembly) → collector (grouping) → consumer
//!                      ↓                        ↓
//!                   BufferPool ←── released frames
//!                      ↓                        ↓
//!                 events / metrics (statistics, drops, disconnects)
//! ```
//!
//! # Design Principles
//!
//! - **Intake never blocks**: the acquisition thread never waits for the
//!   consumer or for a configuration change
//! - **Drops are counted, not fatal**: lost frames show up in statistics
//!   events, never as a crash
//! - **Ownership is explicit**: buffers are moved through the pipeline and
//!   return to their pool when the last frame handle is dropped
//! - **One session per connection**: no global state
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tof_capture::{
//!     collector::{CallbackData, CollectorConfig, FrameCaptureListener, TransmissionMode},
//!     buffer::BufferDataFormat,
//!     session::CaptureSession,
//!     transport::{synthetic::SyntheticCamera, FramingConfig, HeaderFramingConfig, ReassemblerConfig},
//!     usecase::CaptureConfiguration,
//! };
//!
//! struct Print;
//!
//! impl FrameCaptureListener for Print {
//!     fn capture_callback(&self, data: CallbackData) {
//!         println!("{} frames for stream {}", data.frames.len(), data.stream_id);
//!     }
//! }
//!
//! let framing = HeaderFramingConfig::default();
//! let session = CaptureSession::new(
//!     ReassemblerConfig {
//!         framing: FramingConfig::Header(framing.clone()),
//!         ..Default::default()
//!     },
//!     TransmissionMode::Individual,
//!     CollectorConfig::default(),
//! )
//! .unwrap();
//! session.set_listener(Some(Arc::new(Print)));
//!
//! let configuration = CaptureConfiguration::default();
//! let camera = SyntheticCamera::header_framed(&framing, BufferDataFormat::Raw12)
//!     .with_configuration(&configuration);
//! session.open(Box::new(camera)).unwrap();
//! session.execute_configuration(configuration, &[]).unwrap();
//! session.start().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod buffer;
pub mod collector;
pub mod config;
pub mod events;
pub mod metrics;
pub mod sequence;
pub mod session;
pub mod transport;
pub mod usecase;

// Re-export commonly used types at crate root
pub use buffer::{BufferDataFormat, BufferPool, CapturedBuffer};
pub use collector::{CallbackData, FrameCaptureListener, FrameCollector, TransmissionMode};
pub use config::SessionConfig;
pub use events::{Event, EventListener, RawFrameStats};
pub use session::{CaptureSession, SessionError};
pub use transport::{PayloadSource, Reassembler, TransportError};
pub use usecase::CaptureConfiguration;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
