//! Frame counter arithmetic and the pseudodata row.
//!
//! The sensor numbers raw frames with a 12-bit counter that wraps from
//! 0xfff to 0. Every raw frame starts with one row of pseudodata carrying
//! that counter, the frame's position in the capture pattern and the
//! reconfiguration index.

use serde::{Deserialize, Serialize};

/// Mask for frame numbers and reconfiguration indices.
pub const FRAME_NUMBER_MASK: u16 = 0x0fff;

const HALF_WINDOW: u16 = 0x0800;

/// Frame number `n` frames after `base`.
#[inline]
pub fn following(base: u16, n: u16) -> u16 {
    base.wrapping_add(n) & FRAME_NUMBER_MASK
}

/// Number of frames from `rhs` forward to `lhs`.
#[inline]
pub fn fwd_distance(lhs: u16, rhs: u16) -> u16 {
    lhs.wrapping_sub(rhs) & FRAME_NUMBER_MASK
}

/// True if `n` comes strictly after `base`, within half the counter range.
#[inline]
pub fn is_greater_frame(base: u16, n: u16) -> bool {
    let distance = fwd_distance(n, base);
    distance != 0 && distance < HALF_WINDOW
}

/// Word offsets of the metadata fields inside a raw frame's pseudodata row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PseudoDataLayout {
    /// Word holding the 12-bit frame number.
    pub frame_number: usize,
    /// Word holding the sequence index.
    pub sequence_index: usize,
    /// Word holding the 12-bit reconfiguration index.
    pub reconfig_index: usize,
    /// Word holding the raw temperature reading, if the sensor reports one.
    pub temperature: Option<usize>,
    /// Degrees Celsius per raw temperature unit.
    pub temperature_scale: f32,
    /// Degrees Celsius at a raw reading of zero.
    pub temperature_offset: f32,
}

impl Default for PseudoDataLayout {
    fn default() -> Self {
        Self {
            frame_number: 0,
            sequence_index: 1,
            reconfig_index: 2,
            temperature: Some(3),
            temperature_scale: 0.0625,
            temperature_offset: -40.0,
        }
    }
}

impl PseudoDataLayout {
    /// Minimum row width needed to hold every field.
    pub fn required_width(&self) -> usize {
        [
            Some(self.frame_number),
            Some(self.sequence_index),
            Some(self.reconfig_index),
            self.temperature,
        ]
        .into_iter()
        .flatten()
        .max()
        .map_or(0, |w| w + 1)
    }

    #[inline]
    fn word(row: &[u16], index: usize) -> u16 {
        row.get(index).copied().unwrap_or(0)
    }

    /// Frame number of the raw frame.
    pub fn frame_number(&self, row: &[u16]) -> u16 {
        Self::word(row, self.frame_number) & FRAME_NUMBER_MASK
    }

    /// Position of the raw frame in the capture pattern.
    pub fn sequence_index(&self, row: &[u16]) -> u16 {
        Self::word(row, self.sequence_index)
    }

    /// Reconfiguration index of the raw frame.
    pub fn reconfig_index(&self, row: &[u16]) -> u16 {
        Self::word(row, self.reconfig_index) & FRAME_NUMBER_MASK
    }

    /// Sensor temperature in degrees Celsius, if present.
    pub fn temperature(&self, row: &[u16]) -> Option<f32> {
        let index = self.temperature?;
        row.get(index)
            .map(|&raw| raw as f32 * self.temperature_scale + self.temperature_offset)
    }

    /// Writes metadata into a pseudodata row; used by synthetic sources.
    pub fn write(&self, row: &mut [u16], frame_number: u16, sequence_index: u16, reconfig_index: u16) {
        let mut set = |index: usize, value: u16| {
            if let Some(word) = row.get_mut(index) {
                *word = value;
            }
        };
        set(self.frame_number, frame_number & FRAME_NUMBER_MASK);
        set(self.sequence_index, sequence_index);
        set(self.reconfig_index, reconfig_index & FRAME_NUMBER_MASK);
    }
}
