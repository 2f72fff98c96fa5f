//! Captured pixel buffers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw pixel encodings a transport may deliver.
///
/// Every encoding is normalized to one 12-bit value per `u16` before the
/// buffer leaves the reassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferDataFormat {
    /// Not known yet; the header-framed reassembler detects it from the
    /// size of the first complete image.
    #[default]
    Unknown,
    /// Two pixels packed in three bytes.
    Raw12,
    /// One little-endian 16-bit word per pixel.
    Raw16,
}

impl BufferDataFormat {
    /// Number of transport bytes carrying `pixel_count` pixels.
    ///
    /// Returns `None` for [`BufferDataFormat::Unknown`].
    pub fn expected_raw_size(self, pixel_count: usize) -> Option<usize> {
        match self {
            Self::Unknown => None,
            Self::Raw12 => Some(pixel_count * 3 / 2),
            Self::Raw16 => Some(pixel_count * 2),
        }
    }

    /// Largest number of transport bytes that can carry `pixel_count` pixels.
    pub fn max_raw_size(self, pixel_count: usize) -> usize {
        match self {
            Self::Raw12 => pixel_count * 3 / 2,
            Self::Unknown | Self::Raw16 => pixel_count * 2,
        }
    }

    /// Guesses the encoding from the total byte count of one image.
    pub fn detect(raw_size: usize, pixel_count: usize) -> Option<Self> {
        if raw_size == pixel_count * 2 {
            Some(Self::Raw16)
        } else if pixel_count % 2 == 0 && raw_size == pixel_count * 3 / 2 {
            Some(Self::Raw12)
        } else {
            None
        }
    }
}

impl fmt::Display for BufferDataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Raw12 => write!(f, "RAW12"),
            Self::Raw16 => write!(f, "RAW16"),
        }
    }
}

/// Handle identifying the pool slot a buffer was allocated in.
///
/// The generation changes every time the pool is reallocated, so a buffer
/// from an earlier configuration is recognised when it comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolSlot {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

impl PoolSlot {
    /// Index of the slot inside the pool arena.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Allocation generation the slot belongs to.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A fixed-capacity block of normalized pixels plus capture metadata.
pub struct CapturedBuffer {
    pixels: Vec<u16>,
    format: BufferDataFormat,
    timestamp_us: u64,
    slot: Option<PoolSlot>,
}

impl CapturedBuffer {
    /// Creates a zeroed buffer that does not belong to any pool.
    ///
    /// Useful for test harnesses feeding a collector directly.
    pub fn new(pixel_count: usize) -> Self {
        Self {
            pixels: vec![0; pixel_count],
            format: BufferDataFormat::Unknown,
            timestamp_us: 0,
            slot: None,
        }
    }

    /// Creates a buffer from existing pixel data, without a pool slot.
    pub fn from_pixels(pixels: Vec<u16>) -> Self {
        Self {
            pixels,
            format: BufferDataFormat::Unknown,
            timestamp_us: 0,
            slot: None,
        }
    }

    pub(crate) fn pooled(pixel_count: usize, slot: PoolSlot) -> Self {
        Self {
            slot: Some(slot),
            ..Self::new(pixel_count)
        }
    }

    /// Number of pixels the buffer holds.
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }

    /// Normalized pixel values.
    #[inline]
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    /// Mutable access for the party currently filling the buffer.
    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [u16] {
        &mut self.pixels
    }

    /// Encoding the transport delivered the pixels in.
    #[inline]
    pub fn format(&self) -> BufferDataFormat {
        self.format
    }

    /// Records the transport encoding.
    pub fn set_format(&mut self, format: BufferDataFormat) {
        self.format = format;
    }

    /// Hardware timestamp in microseconds, 0 if the transport has none.
    #[inline]
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Sets the hardware timestamp.
    pub fn set_timestamp_us(&mut self, timestamp_us: u64) {
        self.timestamp_us = timestamp_us;
    }

    /// Pool slot this buffer returns to, if any.
    #[inline]
    pub fn slot(&self) -> Option<PoolSlot> {
        self.slot
    }
}

impl fmt::Debug for CapturedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedBuffer")
            .field("pixel_count", &self.pixels.len())
            .field("format", &self.format)
            .field("timestamp_us", &self.timestamp_us)
            .field("slot", &self.slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_raw_size() {
        assert_eq!(BufferDataFormat::Raw16.expected_raw_size(100), Some(200));
        assert_eq!(BufferDataFormat::Raw12.expected_raw_size(100), Some(150));
        assert_eq!(BufferDataFormat::Unknown.expected_raw_size(100), None);
        assert_eq!(BufferDataFormat::Unknown.max_raw_size(100), 200);
    }

    #[test]
    fn test_detect_prefers_raw16() {
        assert_eq!(
            BufferDataFormat::detect(200, 100),
            Some(BufferDataFormat::Raw16)
        );
        assert_eq!(
            BufferDataFormat::detect(150, 100),
            Some(BufferDataFormat::Raw12)
        );
        assert_eq!(BufferDataFormat::detect(151, 100), None);
    }

    #[test]
    fn test_standalone_buffer_has_no_slot() {
        let mut buffer = CapturedBuffer::new(16);
        assert_eq!(buffer.pixel_count(), 16);
        assert!(buffer.slot().is_none());
        buffer.pixels_mut()[3] = 42;
        buffer.set_timestamp_us(7);
        assert_eq!(buffer.pixels()[3], 42);
        assert_eq!(buffer.timestamp_us(), 7);
    }
}
