//! The active capture configuration.
//!
//! Produced by the imager layer and consumed read-only here: which streams
//! exist, which raw frames make up each of their frame groups, and where the
//! pseudodata fields live.

use crate::sequence::PseudoDataLayout;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of one stream of a (possibly mixed-mode) configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u16);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// One stream and its frame groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream identifier reported with every delivered group.
    pub id: StreamId,
    /// Expected sequence indices of each frame group, in order.
    pub frame_groups: Vec<Vec<u16>>,
}

/// Errors found by [`CaptureConfiguration::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsecaseError {
    #[error("configuration has no streams")]
    NoStreams,
    #[error("stream {0} has no frame groups")]
    EmptyStream(StreamId),
    #[error("stream {stream} has an empty frame group")]
    EmptyGroup { stream: StreamId },
    #[error("stream {stream} expects sequence index {index}, but only {count} raw frames are captured")]
    SequenceOutOfRange {
        stream: StreamId,
        index: u16,
        count: u16,
    },
    #[error("image width {width} is too small for the pseudodata row (needs {required})")]
    WidthTooSmall { width: u16, required: usize },
    #[error("invalid image dimensions")]
    InvalidDimensions,
    #[error("target rate must be non-zero")]
    InvalidTargetRate,
}

/// The capture configuration the collector and transport are set up for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfiguration {
    /// Image width in pixels.
    pub image_width: u16,
    /// Image height in pixels, excluding the pseudodata row.
    pub image_height: u16,
    /// Raw frames per repetition of the capture pattern.
    pub raw_frame_count: u16,
    /// Streams and their frame groups.
    pub streams: Vec<StreamConfig>,
    /// Exposure time of each exposure group in microseconds.
    pub exposure_times: Vec<u32>,
    /// Repetitions of the capture pattern per second.
    pub target_rate: u16,
    /// Pseudodata field positions.
    pub pseudo_data: PseudoDataLayout,
}

impl Default for CaptureConfiguration {
    fn default() -> Self {
        Self {
            image_width: 224,
            image_height: 172,
            raw_frame_count: 5,
            streams: vec![StreamConfig {
                id: StreamId(0xdefa),
                frame_groups: vec![(0..5).collect()],
            }],
            exposure_times: vec![200, 1000],
            target_rate: 5,
            pseudo_data: PseudoDataLayout::default(),
        }
    }
}

impl CaptureConfiguration {
    /// Builds a single-stream configuration where every group holds
    /// `group_size` consecutive raw frames.
    pub fn single_stream(width: u16, height: u16, group_size: u16) -> Self {
        Self {
            image_width: width,
            image_height: height,
            raw_frame_count: group_size,
            streams: vec![StreamConfig {
                id: StreamId(0xdefa),
                frame_groups: vec![(0..group_size).collect()],
            }],
            ..Default::default()
        }
    }

    /// Checks that the configuration can be captured.
    pub fn verify(&self) -> Result<(), UsecaseError> {
        if self.image_width == 0 || self.image_height == 0 || self.raw_frame_count == 0 {
            return Err(UsecaseError::InvalidDimensions);
        }
        if self.target_rate == 0 {
            return Err(UsecaseError::InvalidTargetRate);
        }
        if self.streams.is_empty() {
            return Err(UsecaseError::NoStreams);
        }
        let required = self.pseudo_data.required_width();
        if (self.image_width as usize) < required {
            return Err(UsecaseError::WidthTooSmall {
                width: self.image_width,
                required,
            });
        }
        for stream in &self.streams {
            if stream.frame_groups.is_empty() {
                return Err(UsecaseError::EmptyStream(stream.id));
            }
            for group in &stream.frame_groups {
                if group.is_empty() {
                    return Err(UsecaseError::EmptyGroup { stream: stream.id });
                }
                if let Some(&index) = group.iter().find(|&&i| i >= self.raw_frame_count) {
                    return Err(UsecaseError::SequenceOutOfRange {
                        stream: stream.id,
                        index,
                        count: self.raw_frame_count,
                    });
                }
            }
        }
        Ok(())
    }

    /// Pixels in one raw frame, including the pseudodata row.
    pub fn pixels_per_raw_frame(&self) -> usize {
        self.image_width as usize * (self.image_height as usize + 1)
    }

    /// Raw frames accounted between two automatic statistics flushes.
    pub fn frames_per_stats_event(&self) -> usize {
        self.raw_frame_count as usize * self.target_rate as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CaptureConfiguration::default().verify().is_ok());
    }

    #[test]
    fn test_no_streams() {
        let config = CaptureConfiguration {
            streams: vec![],
            ..Default::default()
        };
        assert_eq!(config.verify(), Err(UsecaseError::NoStreams));
    }

    #[test]
    fn test_narrow_image_rejected() {
        let config = CaptureConfiguration::single_stream(2, 4, 1);
        assert!(matches!(
            config.verify(),
            Err(UsecaseError::WidthTooSmall { width: 2, .. })
        ));
    }

    #[test]
    fn test_sequence_out_of_range() {
        let mut config = CaptureConfiguration::single_stream(16, 4, 2);
        config.streams[0].frame_groups[0].push(2);
        assert!(matches!(
            config.verify(),
            Err(UsecaseError::SequenceOutOfRange { index: 2, count: 2, .. })
        ));
    }

    #[test]
    fn test_pixel_counts() {
        let config = CaptureConfiguration::single_stream(16, 4, 9);
        assert_eq!(config.pixels_per_raw_frame(), 80);
        assert_eq!(config.frames_per_stats_event(), 45);
    }

    #[test]
    fn test_parse_from_toml() {
        let text = r#"
            image_width = 32
            image_height = 8
            raw_frame_count = 2

            [[streams]]
            id = 1
            frame_groups = [[0, 1]]
        "#;
        let config: CaptureConfiguration = toml::from_str(text).unwrap();
        assert_eq!(config.streams[0].id, StreamId(1));
        assert_eq!(config.target_rate, 5);
        assert!(config.verify().is_ok());
    }
}
