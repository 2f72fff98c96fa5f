//! Transport payload reassembly.
//!
//! A transport delivers an image in pieces: USB bulk payloads each starting
//! with a small header, or memory-mapped reads whose pixels carry an
//! in-frame marker bit. The [`Reassembler`] runs the acquisition thread
//! that turns those pieces into one normalized [`CapturedBuffer`] per
//! image and hands it to a [`BufferCaptureListener`].
//!
//! ```text
//! PayloadSource → Framing (header | marker) → CapturedBuffer → listener
//!                                  ↑
//!                             BufferPool
//! ```

mod header;
mod marker;
mod reassembler;
pub mod synthetic;

pub use header::{Assembly, HeaderFramedAssembler, HeaderFramingConfig, StrideRing};
pub use marker::{MarkerFramedAssembler, MarkerFramingConfig};
pub use reassembler::{Framing, FramingConfig, Reassembler, ReassemblerConfig, ReassemblerStats};

use crate::buffer::{CapturedBuffer, NormalizeError, PoolError};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by transports and the reassembler.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("read timed out")]
    Timeout,
    #[error("device disconnected")]
    Disconnected,
    #[error("transport I/O error: {0}")]
    Io(String),
    #[error("operation not allowed while capture is running")]
    CaptureRunning,
    #[error("no transport connection is open")]
    NotConnected,
    #[error("invalid buffer size: {0}")]
    InvalidSize(String),
    #[error("buffer pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("failed to spawn acquisition thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl TransportError {
    /// True for errors after which reading may simply be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

/// The device side of a transport: something payloads can be read from.
///
/// Implemented by USB or video drivers; [`synthetic::SyntheticCamera`]
/// implements it for tests and demos.
pub trait PayloadSource: Send {
    /// Queues a read into receive stride `stride` ahead of time, so the
    /// device always has somewhere to put data. Optional.
    fn prepare(&mut self, _stride: usize) -> Result<(), TransportError> {
        Ok(())
    }

    /// Reads the next transport unit into `dest`, waiting at most
    /// `timeout`. Returns the number of bytes written.
    fn receive(&mut self, dest: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Cancels reads queued with [`PayloadSource::prepare`].
    fn cancel_pending(&mut self) {}
}

/// Receiver of reassembled buffers.
pub trait BufferCaptureListener: Send + Sync {
    /// Takes ownership of one complete buffer. Called only from the
    /// acquisition thread, never reentered.
    fn buffer_callback(&self, buffer: CapturedBuffer);

    /// Returns every buffer the listener holds to the pool.
    fn release_all_buffers(&self);
}

/// The part of a transport the frame collector configures.
pub trait BridgeDataReceiver {
    /// Allocates `buffer_count` buffers of `width` x `height` pixels and
    /// returns the number actually allocated.
    fn execute_configuration(
        &self,
        width: u16,
        height: u16,
        buffer_count: usize,
    ) -> Result<usize, TransportError>;
}
