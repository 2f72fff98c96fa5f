//! Conversion of transport pixel encodings to 12-bit pixel values.
//!
//! RAW12 packs two pixels in three bytes. The third byte carries the low
//! nibbles: its low nibble belongs to the first pixel, its high nibble to
//! the second. RAW16 is little-endian with the upper four bits unused (the
//! marker-framed transport stores its in-frame flag in bit 15).

use super::BufferDataFormat;
use thiserror::Error;

/// Mask applied to every normalized pixel.
pub const PIXEL_MASK: u16 = 0x0fff;

/// Errors raised while normalizing transport bytes into a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("normalized data would overflow the destination ({needed} > {capacity} pixels)")]
    Overflow { needed: usize, capacity: usize },
    #[error("chunk of {len} bytes is not a whole number of {format} pixel groups")]
    UnalignedChunk { len: usize, format: BufferDataFormat },
    #[error("pixel format is unknown")]
    UnknownFormat,
}

/// Normalizes one chunk of transport bytes into `dest`.
///
/// Returns the number of pixels written.
pub fn normalize_into(
    format: BufferDataFormat,
    src: &[u8],
    dest: &mut [u16],
) -> Result<usize, NormalizeError> {
    match format {
        BufferDataFormat::Unknown => Err(NormalizeError::UnknownFormat),
        BufferDataFormat::Raw12 => {
            if src.len() % 3 != 0 {
                return Err(NormalizeError::UnalignedChunk {
                    len: src.len(),
                    format,
                });
            }
            let needed = src.len() / 3 * 2;
            if needed > dest.len() {
                return Err(NormalizeError::Overflow {
                    needed,
                    capacity: dest.len(),
                });
            }
            for (packed, out) in src.chunks_exact(3).zip(dest.chunks_exact_mut(2)) {
                let (s0, s1, s2) = (packed[0] as u16, packed[1] as u16, packed[2] as u16);
                out[0] = (s0 << 4) | (s2 & 0x0f);
                out[1] = (s1 << 4) | (s2 >> 4);
            }
            Ok(needed)
        }
        BufferDataFormat::Raw16 => {
            if src.len() % 2 != 0 {
                return Err(NormalizeError::UnalignedChunk {
                    len: src.len(),
                    format,
                });
            }
            let needed = src.len() / 2;
            if needed > dest.len() {
                return Err(NormalizeError::Overflow {
                    needed,
                    capacity: dest.len(),
                });
            }
            for (word, out) in src.chunks_exact(2).zip(dest.iter_mut()) {
                *out = u16::from_le_bytes([word[0], word[1]]) & PIXEL_MASK;
            }
            Ok(needed)
        }
    }
}

/// Normalizes a sequence of chunks back to back into `dest`.
///
/// Used for images that arrive spread over several transport strides.
/// Returns the total number of pixels written.
pub fn copy_and_normalize_chunks<'a>(
    format: BufferDataFormat,
    chunks: impl IntoIterator<Item = &'a [u8]>,
    dest: &mut [u16],
) -> Result<usize, NormalizeError> {
    let mut written = 0;
    for chunk in chunks {
        let remaining = dest.len() - written;
        written += normalize_into(format, chunk, &mut dest[written..]).map_err(|e| match e {
            NormalizeError::Overflow { needed, .. } => NormalizeError::Overflow {
                needed: written + needed,
                capacity: written + remaining,
            },
            other => other,
        })?;
    }
    Ok(written)
}

/// Packs 12-bit pixels into RAW12 transport bytes.
///
/// An odd trailing pixel is padded with a zero pixel.
pub fn pack_raw12(pixels: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity((pixels.len() + 1) / 2 * 3);
    for pair in pixels.chunks(2) {
        let first = pair[0] & PIXEL_MASK;
        let second = pair.get(1).copied().unwrap_or(0) & PIXEL_MASK;
        out.push((first >> 4) as u8);
        out.push((second >> 4) as u8);
        out.push(((first & 0x0f) | ((second & 0x0f) << 4)) as u8);
    }
    out
}

/// Packs pixels into little-endian RAW16 words, optionally setting the
/// in-frame marker bit (bit 15) on each of them.
pub fn pack_raw16(pixels: &[u16], in_frame_marker: bool) -> Vec<u8> {
    let marker = if in_frame_marker { 0x8000 } else { 0 };
    pixels
        .iter()
        .flat_map(|p| ((p & PIXEL_MASK) | marker).to_le_bytes())
        .collect()
}
