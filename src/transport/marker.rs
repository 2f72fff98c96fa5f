//! Reassembly of marker-framed reads.
//!
//! The device streams RAW16 pixels with bit 15 set for every pixel inside
//! an image and cleared for the padding between images. Each read covers
//! one image plus part of the padding, rounded down to the device's packet
//! size. When the device drops data the stream slips by whole packets; the
//! assembler finds the image start again and reads the missing tail.

use super::header::Assembly;
use super::{PayloadSource, TransportError};
use crate::buffer::{normalize_into, BufferDataFormat, CapturedBuffer};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings of the marker-framed transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerFramingConfig {
    /// Granularity in bytes of device transfers. Misalignment is always a
    /// multiple of it.
    pub min_packet_size: usize,
    /// Padding bytes the device inserts after every image.
    pub padding_size: usize,
    /// Images after a successful realignment during which a further
    /// misalignment is not realigned again.
    pub single_realign_count: u32,
    /// Images to wait after a misalignment had to be skipped.
    pub double_realign_count: u32,
    /// Timeout of one read.
    pub read_timeout_ms: u64,
}

impl Default for MarkerFramingConfig {
    fn default() -> Self {
        Self {
            min_packet_size: 512,
            padding_size: 1024,
            single_realign_count: 2,
            double_realign_count: 100,
            read_timeout_ms: 500,
        }
    }
}

impl MarkerFramingConfig {
    /// Bytes read per image of `pixel_count` pixels: the image and its
    /// padding, rounded down to whole packets.
    pub fn raw_read_size(&self, pixel_count: usize) -> usize {
        let total = pixel_count * 2 + self.padding_size;
        if self.min_packet_size == 0 {
            total
        } else {
            total / self.min_packet_size * self.min_packet_size
        }
    }

    /// Timeout of one read.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[inline]
fn in_frame(raw: &[u8], offset: usize) -> bool {
    raw[offset + 1] & 0x80 != 0
}

/// Finds the image start in a read.
///
/// Returns `Some(0)` when the read starts with an image and ends in
/// padding, the offset of a packet-aligned image start otherwise, or
/// `None` if the read cannot be realigned.
pub(crate) fn check_alignment(raw: &[u8], packet_size: usize) -> Option<usize> {
    let size = raw.len();
    if size < 4 {
        return None;
    }
    if in_frame(raw, 0) && !in_frame(raw, size - 2) && !in_frame(raw, size - 4) {
        return Some(0);
    }
    if packet_size < 4 {
        return None;
    }
    (packet_size..size)
        .step_by(packet_size)
        .find(|&offset| in_frame(raw, offset) && !in_frame(raw, offset - 2) && !in_frame(raw, offset - 4))
}

/// Assembles marker-framed reads into captured buffers.
#[derive(Debug)]
pub struct MarkerFramedAssembler {
    config: MarkerFramingConfig,
    pixel_count: usize,
    raw: Vec<u8>,
    realign_counter: u32,
    images: u64,
    discarded: u64,
    realignments: u64,
}

impl MarkerFramedAssembler {
    /// Creates an assembler for images of `pixel_count` pixels.
    pub fn new(config: MarkerFramingConfig, pixel_count: usize) -> Result<Self, TransportError> {
        let read_size = config.raw_read_size(pixel_count);
        if read_size < pixel_count * 2 + 4 {
            return Err(TransportError::InvalidSize(format!(
                "read of {} bytes leaves no padding after {} pixels",
                read_size, pixel_count
            )));
        }
        tracing::debug!(pixel_count, read_size, "Marker framing configured");
        Ok(Self {
            config,
            pixel_count,
            raw: vec![0; read_size],
            realign_counter: 0,
            images: 0,
            discarded: 0,
            realignments: 0,
        })
    }

    /// Bytes read per image.
    #[inline]
    pub fn read_size(&self) -> usize {
        self.raw.len()
    }

    /// Images thrown away so far.
    #[inline]
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Successful realignments so far.
    #[inline]
    pub fn realignments(&self) -> u64 {
        self.realignments
    }

    /// Images completed so far.
    #[inline]
    pub fn images(&self) -> u64 {
        self.images
    }

    fn read_full(
        &mut self,
        source: &mut dyn PayloadSource,
        from: usize,
    ) -> Result<(), TransportError> {
        let timeout = self.config.read_timeout();
        let mut filled = from;
        while filled < self.raw.len() {
            let read = source.receive(&mut self.raw[filled..], timeout)?;
            if read == 0 {
                return Err(TransportError::Timeout);
            }
            filled += read;
        }
        Ok(())
    }

    fn discard(&mut self, reason: &str) -> Assembly {
        tracing::debug!(reason, "Discarding image");
        self.discarded += 1;
        Assembly::Discarded
    }

    /// Reads one image into `buffer`, realigning the stream if needed.
    pub fn poll(
        &mut self,
        source: &mut dyn PayloadSource,
        buffer: &mut CapturedBuffer,
    ) -> Result<Assembly, TransportError> {
        if buffer.pixel_count() < self.pixel_count {
            return Err(TransportError::InvalidSize(format!(
                "buffer of {} pixels is smaller than the {} pixel image",
                buffer.pixel_count(),
                self.pixel_count
            )));
        }
        match self.read_full(source, 0) {
            Ok(()) => {}
            Err(TransportError::Timeout) => return Ok(Assembly::Pending),
            Err(e) => return Err(e),
        }

        let size = self.raw.len();
        match check_alignment(&self.raw, self.config.min_packet_size) {
            Some(0) => {}
            Some(offset) if self.realign_counter == 0 => {
                tracing::debug!(offset, "Image not aligned, realigning");
                self.realign_counter = self.config.single_realign_count;
                self.raw.copy_within(offset.., 0);
                match self.read_full(source, size - offset) {
                    Ok(()) => {}
                    Err(TransportError::Timeout) => {
                        return Ok(self.discard("timeout while realigning"));
                    }
                    Err(e) => return Err(e),
                }
                if check_alignment(&self.raw, self.config.min_packet_size) != Some(0) {
                    return Ok(self.discard("not aligned after realignment"));
                }
                self.realignments += 1;
            }
            Some(offset) => {
                // realigned recently; only clear the device's backlog
                tracing::debug!(offset, "Image not aligned again, skipping");
                match self.read_full(source, size - offset) {
                    Ok(()) | Err(TransportError::Timeout) => {}
                    Err(e) => return Err(e),
                }
                self.realign_counter = self.config.double_realign_count;
                return Ok(self.discard("repeated misalignment"));
            }
            None => return Ok(self.discard("image start not found")),
        }

        let image = &self.raw[..self.pixel_count * 2];
        normalize_into(BufferDataFormat::Raw16, image, buffer.pixels_mut())?;
        buffer.set_format(BufferDataFormat::Raw16);
        self.images += 1;
        self.realign_counter = self.realign_counter.saturating_sub(1);
        Ok(Assembly::Complete)
    }
}
