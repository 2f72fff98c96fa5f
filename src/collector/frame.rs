//! Raw frames as views into captured buffers.
//!
//! A buffer carrying several raw frames is wrapped in a [`BufferHolder`]
//! once, and each raw frame is a `(holder, position)` pair. The buffer goes
//! back to its pool when the last frame referring to it is dropped, so it
//! is returned exactly once no matter how many groups shared its frames.

use crate::buffer::{BufferReleaser, CapturedBuffer, PoolSlot};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct BufferHolder {
    buffer: CapturedBuffer,
    releaser: Arc<dyn BufferReleaser>,
    pixels_per_frame: usize,
    width: usize,
}

impl BufferHolder {
    pub(crate) fn new(
        buffer: CapturedBuffer,
        releaser: Arc<dyn BufferReleaser>,
        pixels_per_frame: usize,
        width: usize,
    ) -> Self {
        Self {
            buffer,
            releaser,
            pixels_per_frame,
            width,
        }
    }

    /// Raw frames that fit in the buffer.
    pub(crate) fn frame_capacity(&self) -> usize {
        if self.pixels_per_frame == 0 {
            0
        } else {
            self.buffer.pixel_count() / self.pixels_per_frame
        }
    }
}

impl Drop for BufferHolder {
    fn drop(&mut self) {
        let buffer = std::mem::replace(&mut self.buffer, CapturedBuffer::from_pixels(Vec::new()));
        self.releaser.release_buffer(buffer);
    }
}

struct FrameShared {
    holder: Arc<BufferHolder>,
    position: usize,
    delivered: AtomicBool,
}

/// One raw frame: a pseudodata row followed by the image rows.
///
/// Cloning is cheap; every clone refers to the same pixels.
#[derive(Clone)]
pub struct RawFrame {
    inner: Arc<FrameShared>,
}

impl RawFrame {
    pub(crate) fn new(holder: Arc<BufferHolder>, position: usize) -> Self {
        Self {
            inner: Arc::new(FrameShared {
                holder,
                position,
                delivered: AtomicBool::new(false),
            }),
        }
    }

    /// All pixels of the frame, pseudodata row first.
    pub fn pixels(&self) -> &[u16] {
        let holder = &self.inner.holder;
        let start = self.pixel_offset();
        &holder.buffer.pixels()[start..start + holder.pixels_per_frame]
    }

    /// The pseudodata row.
    pub fn pseudo_data(&self) -> &[u16] {
        &self.pixels()[..self.inner.holder.width]
    }

    /// The image rows.
    pub fn image_data(&self) -> &[u16] {
        &self.pixels()[self.inner.holder.width..]
    }

    /// Position of the frame inside its buffer.
    #[inline]
    pub fn position(&self) -> usize {
        self.inner.position
    }

    /// Pixel offset of the frame inside its buffer.
    #[inline]
    pub fn pixel_offset(&self) -> usize {
        self.inner.position * self.inner.holder.pixels_per_frame
    }

    /// Pool slot of the buffer the frame lives in.
    pub fn buffer_slot(&self) -> Option<PoolSlot> {
        self.inner.holder.buffer.slot()
    }

    /// Hardware timestamp of the buffer, 0 if unknown.
    pub fn timestamp_us(&self) -> u64 {
        self.inner.holder.buffer.timestamp_us()
    }

    /// True if both handles refer to the same raw frame.
    pub fn same_frame(&self, other: &RawFrame) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Marks the frame as delivered; true the first time only.
    pub(crate) fn mark_delivered(&self) -> bool {
        !self.inner.delivered.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_delivered(&self) -> bool {
        self.inner.delivered.load(Ordering::Acquire)
    }

    /// True if no other handle to this frame exists.
    pub(crate) fn is_last_reference(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("slot", &self.buffer_slot())
            .field("position", &self.inner.position)
            .field("pixels", &self.inner.holder.pixels_per_frame)
            .finish()
    }
}

/// Releases the frames in `slots` and returns how many of them were lost:
/// never delivered and no longer referenced from anywhere else.
pub(crate) fn release_slots(slots: &mut [Option<RawFrame>]) -> u64 {
    let mut dropped = 0;
    for frame in slots.iter_mut().filter_map(Option::take) {
        if !frame.is_delivered() && frame.is_last_reference() {
            dropped += 1;
        }
    }
    dropped
}
