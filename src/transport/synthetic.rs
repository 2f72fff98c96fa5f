//! A software camera for tests, benchmarks and the demo binary.
//!
//! Produces the raw frames of a [`CaptureConfiguration`] cycle after cycle,
//! encoded the way a real device would send them over either framing.

use super::{HeaderFramingConfig, MarkerFramingConfig, PayloadSource, TransportError};
use crate::buffer::{pack_raw12, pack_raw16, BufferDataFormat, PIXEL_MASK};
use crate::sequence::{following, PseudoDataLayout};
use crate::usecase::CaptureConfiguration;
use std::collections::{BTreeSet, VecDeque};
use std::thread;
use std::time::Duration;

/// Raw temperature reading written into the pseudodata row (25 °C with the
/// default layout).
const RAW_TEMPERATURE: u16 = 1040;

/// Fills `dest` with one raw frame: the pseudodata row followed by image
/// rows with a pattern derived from the frame number.
pub fn render_raw_frame(
    dest: &mut [u16],
    width: usize,
    layout: &PseudoDataLayout,
    frame_number: u16,
    sequence_index: u16,
    reconfig_index: u16,
) {
    for (i, pixel) in dest.iter_mut().enumerate() {
        *pixel = (frame_number as usize * 7 + i) as u16 & PIXEL_MASK;
    }
    let n = width.min(dest.len());
    let row = &mut dest[..n];
    layout.write(row, frame_number, sequence_index, reconfig_index);
    if let Some(word) = layout.temperature.and_then(|index| row.get_mut(index)) {
        *word = RAW_TEMPERATURE;
    }
}

#[derive(Debug)]
enum Encoding {
    Header {
        format: BufferDataFormat,
        header_size: usize,
        payload_data_size: usize,
    },
    Marker(MarkerFramingConfig),
}

/// Software [`PayloadSource`] producing a configured capture pattern.
#[derive(Debug)]
pub struct SyntheticCamera {
    encoding: Encoding,
    width: usize,
    height: usize,
    layout: PseudoDataLayout,
    raw_frame_count: u16,
    blocks: Option<Vec<u16>>,
    frame_number: u16,
    reconfig_index: u16,
    sequence_position: usize,
    dropped: BTreeSet<u64>,
    misalignment: usize,
    limit: Option<u64>,
    produced: u64,
    disconnect_when_done: bool,
    interval: Option<Duration>,
    fid: bool,
    payloads: VecDeque<Vec<u8>>,
    stream: VecDeque<u8>,
}

impl SyntheticCamera {
    fn with_encoding(encoding: Encoding) -> Self {
        let configuration = CaptureConfiguration::default();
        Self {
            encoding,
            width: 0,
            height: 0,
            layout: PseudoDataLayout::default(),
            raw_frame_count: 1,
            blocks: None,
            frame_number: 0,
            reconfig_index: 0,
            sequence_position: 0,
            dropped: BTreeSet::new(),
            misalignment: 0,
            limit: None,
            produced: 0,
            disconnect_when_done: false,
            interval: None,
            fid: false,
            payloads: VecDeque::new(),
            stream: VecDeque::new(),
        }
        .with_configuration(&configuration)
    }

    /// A camera sending header-framed payloads in `format`.
    pub fn header_framed(config: &HeaderFramingConfig, format: BufferDataFormat) -> Self {
        let format = match format {
            BufferDataFormat::Unknown => BufferDataFormat::Raw16,
            known => known,
        };
        // a multiple of six keeps every payload whole in both encodings
        let room = config.stride_size.saturating_sub(config.header_size) / 6 * 6;
        let payload_data_size = ((config.min_payload_data_size + 5) / 6 * 6).clamp(6, room.max(6));
        Self::with_encoding(Encoding::Header {
            format,
            header_size: config.header_size,
            payload_data_size,
        })
    }

    /// A camera streaming marker-framed RAW16 pixels with padding.
    pub fn marker_framed(config: &MarkerFramingConfig) -> Self {
        Self::with_encoding(Encoding::Marker(config.clone()))
    }

    /// Takes image size, pseudodata layout and pattern length from a
    /// configuration.
    pub fn with_configuration(mut self, configuration: &CaptureConfiguration) -> Self {
        self.width = configuration.image_width as usize;
        self.height = configuration.image_height as usize;
        self.layout = configuration.pseudo_data.clone();
        self.raw_frame_count = configuration.raw_frame_count.max(1);
        self
    }

    /// Sends several raw frames per buffer, `blocks[i]` frames in the
    /// `i`-th buffer of each cycle. Shorter blocks are padded to the
    /// largest one.
    pub fn with_blocks(mut self, blocks: Vec<u16>) -> Self {
        self.blocks = Some(blocks);
        self
    }

    /// First frame number to send.
    pub fn with_start_frame(mut self, frame_number: u16) -> Self {
        self.frame_number = frame_number & PIXEL_MASK;
        self
    }

    /// Reconfiguration index written into every frame.
    pub fn with_reconfig_index(mut self, reconfig_index: u16) -> Self {
        self.reconfig_index = reconfig_index;
        self
    }

    /// Skips the buffers with these zero-based indices, as if the device had
    /// lost them. Frame numbers still advance.
    pub fn with_dropped_buffers(mut self, buffers: impl IntoIterator<Item = u64>) -> Self {
        self.dropped.extend(buffers);
        self
    }

    /// Prepends `bytes` of padding to a marker-framed stream so the first
    /// read is misaligned.
    pub fn with_misalignment(mut self, bytes: usize) -> Self {
        self.misalignment = bytes;
        self
    }

    /// Stops after `buffers` buffers.
    pub fn with_limit(mut self, buffers: u64) -> Self {
        self.limit = Some(buffers);
        self
    }

    /// Waits this long before producing each buffer.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Reports a disconnect once the limit is reached instead of timing out.
    pub fn disconnect_when_done(mut self) -> Self {
        self.disconnect_when_done = true;
        self
    }

    /// Buffers produced so far, dropped ones included.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn frame_pixels(&self) -> usize {
        self.width * (self.height + 1)
    }

    fn max_block(&self) -> usize {
        self.blocks
            .as_ref()
            .and_then(|blocks| blocks.iter().copied().max())
            .map_or(1, |max| max.max(1) as usize)
    }

    /// Pixels per buffer.
    pub fn buffer_pixels(&self) -> usize {
        self.frame_pixels() * self.max_block()
    }

    fn next_block(&mut self) -> u16 {
        match &self.blocks {
            Some(blocks) if blocks.iter().any(|&b| b != 0) => {
                loop {
                    let block = blocks[self.sequence_position % blocks.len()];
                    if block != 0 {
                        return block;
                    }
                    self.sequence_position += 1;
                }
            }
            _ => 1,
        }
    }

    /// Renders the next buffer, or `None` for a dropped one.
    fn render_buffer(&mut self) -> Option<Vec<u16>> {
        let block = self.next_block();
        let base: u16 = match &self.blocks {
            Some(blocks) if blocks.iter().any(|&b| b != 0) => {
                let position = self.sequence_position % blocks.len();
                blocks[..position].iter().sum()
            }
            _ => (self.sequence_position % self.raw_frame_count as usize) as u16,
        };
        let frame_pixels = self.frame_pixels();
        let mut pixels = vec![0u16; self.buffer_pixels()];
        for k in 0..block {
            let frame = &mut pixels[k as usize * frame_pixels..(k as usize + 1) * frame_pixels];
            render_raw_frame(
                frame,
                self.width,
                &self.layout,
                following(self.frame_number, k),
                base + k,
                self.reconfig_index,
            );
        }

        let index = self.produced;
        self.produced += 1;
        self.sequence_position += 1;
        self.frame_number = following(self.frame_number, block);
        (!self.dropped.contains(&index)).then_some(pixels)
    }

    /// Produces the next transport unit; false once the limit is reached.
    fn refill(&mut self) -> bool {
        loop {
            if self.limit.is_some_and(|limit| self.produced >= limit) {
                return false;
            }
            if let Some(interval) = self.interval {
                thread::sleep(interval);
            }
            if let Some(pixels) = self.render_buffer() {
                self.encode(&pixels);
                return true;
            }
        }
    }

    fn encode(&mut self, pixels: &[u16]) {
        match &self.encoding {
            &Encoding::Header {
                format,
                header_size,
                payload_data_size,
            } => {
                let raw = match format {
                    BufferDataFormat::Raw12 => pack_raw12(pixels),
                    _ => pack_raw16(pixels, false),
                };
                let chunks: Vec<&[u8]> = raw.chunks(payload_data_size).collect();
                let last = chunks.len().saturating_sub(1);
                for (i, chunk) in chunks.into_iter().enumerate() {
                    let mut payload = vec![0u8; header_size];
                    payload[0] = header_size as u8;
                    payload[1] = self.fid as u8 | if i == last { 0x02 } else { 0 };
                    payload.extend_from_slice(chunk);
                    self.payloads.push_back(payload);
                }
                self.fid = !self.fid;
            }
            Encoding::Marker(config) => {
                let read_size = config.raw_read_size(pixels.len());
                if self.misalignment > 0 {
                    self.stream.extend(std::iter::repeat(0).take(self.misalignment));
                    self.misalignment = 0;
                }
                let mut raw = pack_raw16(pixels, true);
                raw.resize(read_size.max(raw.len()), 0);
                self.stream.extend(raw);
            }
        }
    }

    fn exhausted(&self, timeout: Duration) -> TransportError {
        if self.disconnect_when_done {
            TransportError::Disconnected
        } else {
            thread::sleep(timeout.min(Duration::from_millis(10)));
            TransportError::Timeout
        }
    }
}

impl PayloadSource for SyntheticCamera {
    fn receive(&mut self, dest: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let header_framed = matches!(self.encoding, Encoding::Header { .. });
        let empty = if header_framed {
            self.payloads.is_empty()
        } else {
            self.stream.is_empty()
        };
        if empty && !self.refill() {
            return Err(self.exhausted(timeout));
        }

        if header_framed {
            let Some(payload) = self.payloads.pop_front() else {
                return Err(TransportError::Timeout);
            };
            if payload.len() > dest.len() {
                return Err(TransportError::Io(format!(
                    "payload of {} bytes does not fit a {} byte stride",
                    payload.len(),
                    dest.len()
                )));
            }
            dest[..payload.len()].copy_from_slice(&payload);
            Ok(payload.len())
        } else {
            let n = dest.len().min(self.stream.len());
            for (d, b) in dest.iter_mut().zip(self.stream.drain(..n)) {
                *d = b;
            }
            Ok(n)
        }
    }

    fn cancel_pending(&mut self) {
        // a partially sent image would otherwise confuse the next capture
        self.payloads.clear();
    }
}
