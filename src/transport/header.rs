//! Reassembly of header-framed payloads (UVC-style bulk transfers).
//!
//! Every payload starts with a fixed-size header. Byte 0 holds the header
//! length; byte 1 holds the frame identifier (bit 0), which toggles once per
//! image, and the end-of-frame flag (bit 1). All payloads of an image but
//! the last have the size of the first one.

use super::{PayloadSource, TransportError};
use crate::buffer::{copy_and_normalize_chunks, BufferDataFormat, CapturedBuffer};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const FID_BIT: u8 = 0x01;
const EOF_BIT: u8 = 0x02;

/// Settings of the header-framed transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderFramingConfig {
    /// Bytes reserved for one payload.
    pub stride_size: usize,
    /// Payload header length in bytes.
    pub header_size: usize,
    /// Smallest payload data size the device uses for non-final payloads.
    /// Determines how many strides one image can need.
    pub min_payload_data_size: usize,
    /// Timeout of one payload read.
    pub read_timeout_ms: u64,
    /// Pixel encoding, or [`BufferDataFormat::Unknown`] to detect it.
    pub format: BufferDataFormat,
}

impl Default for HeaderFramingConfig {
    fn default() -> Self {
        Self {
            stride_size: 16 * 1024,
            header_size: 12,
            min_payload_data_size: 0x2c00,
            read_timeout_ms: 500,
            format: BufferDataFormat::Unknown,
        }
    }
}

impl HeaderFramingConfig {
    /// Strides needed for an image of `raw_size` bytes.
    pub fn stride_count(&self, raw_size: usize) -> usize {
        if raw_size < self.min_payload_data_size || self.min_payload_data_size == 0 {
            2
        } else {
            raw_size / self.min_payload_data_size + 1
        }
    }

    /// Timeout of one payload read.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Circular set of receive strides.
///
/// Reads are queued on strides ahead of time ("prepared") and complete in
/// order. Strides holding the image being assembled are not prepared again
/// until the image is done.
#[derive(Debug)]
pub struct StrideRing {
    data: Vec<u8>,
    stride_size: usize,
    count: usize,
    next_prepare: usize,
    next_receive: usize,
    prepared: usize,
}

impl StrideRing {
    /// Allocates `count` strides of `stride_size` bytes.
    pub fn new(count: usize, stride_size: usize) -> Self {
        Self {
            data: vec![0; count * stride_size],
            stride_size,
            count,
            next_prepare: 0,
            next_receive: 0,
            prepared: 0,
        }
    }

    /// Number of strides.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Strides with a read queued on them.
    #[inline]
    pub fn prepared(&self) -> usize {
        self.prepared
    }

    /// True if a stride is free to be prepared.
    #[inline]
    pub fn has_unprepared(&self) -> bool {
        self.prepared < self.count
    }

    /// Queues a read on the next free stride.
    pub fn prepare_next(&mut self, source: &mut dyn PayloadSource) -> Result<(), TransportError> {
        source.prepare(self.next_prepare)?;
        self.next_prepare = (self.next_prepare + 1) % self.count;
        self.prepared += 1;
        Ok(())
    }

    /// Completes the oldest queued read. Returns the stride and byte count.
    pub fn receive(
        &mut self,
        source: &mut dyn PayloadSource,
        timeout: Duration,
    ) -> Result<(usize, usize), TransportError> {
        let stride = self.next_receive;
        let start = stride * self.stride_size;
        let len = source.receive(&mut self.data[start..start + self.stride_size], timeout)?;
        self.next_receive = (stride + 1) % self.count;
        self.prepared = self.prepared.saturating_sub(1);
        Ok((stride, len))
    }

    /// Bytes of stride `index`.
    pub fn stride(&self, index: usize) -> &[u8] {
        let start = index * self.stride_size;
        &self.data[start..start + self.stride_size]
    }

    /// Drops all queued reads.
    pub fn reset(&mut self, source: &mut dyn PayloadSource) {
        source.cancel_pending();
        self.next_prepare = self.next_receive;
        self.prepared = 0;
    }
}

/// Outcome of processing one transport unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assembly {
    /// More data is needed.
    Pending,
    /// The buffer holds a complete image.
    Complete,
    /// The image in progress was thrown away.
    Discarded,
}

#[derive(Debug, Clone, Copy)]
struct FrameStart {
    stride: usize,
    first_payload_size: usize,
    strides: usize,
}

/// Assembles header-framed payloads into captured buffers.
#[derive(Debug)]
pub struct HeaderFramedAssembler {
    config: HeaderFramingConfig,
    ring: StrideRing,
    format: BufferDataFormat,
    max_raw_size: usize,
    fid: bool,
    start: Option<FrameStart>,
    payloads: u64,
    discarded: u64,
}

impl HeaderFramedAssembler {
    /// Creates an assembler for images of `pixel_count` pixels.
    pub fn new(config: HeaderFramingConfig, pixel_count: usize) -> Result<Self, TransportError> {
        if config.stride_size <= config.header_size {
            return Err(TransportError::InvalidSize(format!(
                "stride of {} bytes cannot hold a {} byte header",
                config.stride_size, config.header_size
            )));
        }
        let max_raw_size = config.format.max_raw_size(pixel_count);
        let strides = config.stride_count(max_raw_size);
        tracing::debug!(pixel_count, max_raw_size, strides, "Header framing configured");
        Ok(Self {
            ring: StrideRing::new(strides, config.stride_size),
            format: config.format,
            config,
            max_raw_size,
            fid: false,
            start: None,
            payloads: 0,
            discarded: 0,
        })
    }

    /// Pixel encoding in use, once known.
    #[inline]
    pub fn format(&self) -> BufferDataFormat {
        self.format
    }

    /// Payloads received so far.
    #[inline]
    pub fn payloads(&self) -> u64 {
        self.payloads
    }

    /// Images thrown away so far.
    #[inline]
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Receive strides in the ring.
    #[inline]
    pub fn stride_count(&self) -> usize {
        self.ring.count()
    }

    fn discard(&mut self, reason: &str) -> Assembly {
        tracing::warn!(reason, "Discarding image");
        self.start = None;
        self.discarded += 1;
        Assembly::Discarded
    }

    /// Reads and processes one payload, writing a finished image into
    /// `buffer`.
    pub fn poll(
        &mut self,
        source: &mut dyn PayloadSource,
        buffer: &mut CapturedBuffer,
    ) -> Result<Assembly, TransportError> {
        if self.start.is_none() {
            while self.ring.has_unprepared() {
                self.ring.prepare_next(source)?;
            }
        } else if self.ring.prepared() == 0 {
            self.ring.prepare_next(source)?;
        }

        let (stride, received) = match self.ring.receive(source, self.config.read_timeout()) {
            Ok(result) => result,
            Err(TransportError::Timeout) => {
                if self.start.take().is_some() {
                    tracing::debug!("Timeout in the middle of an image");
                }
                return Ok(Assembly::Pending);
            }
            Err(e) => return Err(e),
        };
        self.payloads += 1;

        let header_size = self.config.header_size;
        if received < header_size {
            tracing::debug!(received, "Short payload ignored");
            return Ok(Assembly::Pending);
        }
        let (length, flags) = {
            let header = self.ring.stride(stride);
            (header[0], header[1])
        };
        if length as usize != header_size {
            tracing::debug!(length, "Unexpected payload header length");
            return Ok(self.discard("corrupt payload header"));
        }
        let fid = flags & FID_BIT != 0;
        let eof = flags & EOF_BIT != 0;

        let start = match self.start {
            None => {
                self.fid = fid;
                FrameStart {
                    stride,
                    first_payload_size: received,
                    strides: 1,
                }
            }
            Some(_) if fid != self.fid => {
                // a new image started before the previous one ended
                self.discard("frame identifier toggled without end of frame");
                self.fid = fid;
                FrameStart {
                    stride,
                    first_payload_size: received,
                    strides: 1,
                }
            }
            Some(mut start) => {
                if received != start.first_payload_size && !eof {
                    return Ok(self.discard("payload size changed inside image"));
                }
                start.strides += 1;
                if start.strides > self.ring.count() {
                    return Ok(self.discard("image needs more strides than available"));
                }
                start
            }
        };

        let data_size = start.first_payload_size - header_size;
        let raw_size = data_size * (start.strides - 1) + (received - header_size);
        if raw_size > self.max_raw_size {
            tracing::error!(raw_size, max = self.max_raw_size, "Image larger than buffer");
            return Ok(self.discard("too much data"));
        }

        if !eof {
            self.start = Some(start);
            return Ok(Assembly::Pending);
        }
        self.start = None;
        self.fid = !fid;

        let pixel_count = buffer.pixel_count();
        if self.format == BufferDataFormat::Unknown {
            match BufferDataFormat::detect(raw_size, pixel_count) {
                Some(format) => {
                    tracing::info!(%format, "Detected pixel format");
                    self.format = format;
                }
                None => return Ok(self.discard("cannot detect pixel format from image size")),
            }
        }
        if self.format.expected_raw_size(pixel_count) != Some(raw_size) {
            return Ok(self.discard("incomplete image"));
        }

        let count = self.ring.count();
        let chunks = (0..start.strides).map(|k| {
            let index = (start.stride + k) % count;
            let end = if k + 1 == start.strides {
                received
            } else {
                start.first_payload_size
            };
            &self.ring.stride(index)[header_size..end]
        });
        match copy_and_normalize_chunks(self.format, chunks, buffer.pixels_mut()) {
            Ok(_) => {
                buffer.set_format(self.format);
                Ok(Assembly::Complete)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Normalization failed");
                self.start = None;
                self.discarded += 1;
                Ok(Assembly::Discarded)
            }
        }
    }

    /// Cancels queued reads and forgets the image in progress.
    pub fn reset(&mut self, source: &mut dyn PayloadSource) {
        self.ring.reset(source);
        self.start = None;
    }
}
