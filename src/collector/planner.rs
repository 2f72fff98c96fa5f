//! Buffer action planning.
//!
//! For a configuration, precomputes where every raw frame of an incoming
//! buffer goes: which frame group and which slot in it, and which groups
//! can be completed once the buffer has been distributed. The plan is a
//! pure function of its inputs and is looked up, never recomputed, on the
//! intake path.

use crate::usecase::{CaptureConfiguration, StreamId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors raised while planning buffer actions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("configuration has no frame groups")]
    NoGroups,
    #[error("superframe transmission needs at least one non-empty block")]
    EmptyBlockSizes,
    #[error("sequence index {0} is not covered by any superframe block")]
    SequenceOutOfRange(u16),
}

/// How the transport packs raw frames into buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionMode {
    /// One raw frame per buffer.
    #[default]
    Individual,
    /// Blocks of consecutive raw frames share one buffer.
    Superframe,
}

/// One stream's repeating unit: the sequence indices of its raw frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorFrameGroup {
    /// Stream the group belongs to.
    pub stream_id: StreamId,
    /// Expected sequence index of each slot.
    pub sequence: Vec<u16>,
}

/// Flattens the streams of a configuration into frame groups.
///
/// Group indices in a [`BufferAction`] refer to this order.
pub fn collector_frame_groups(configuration: &CaptureConfiguration) -> Vec<CollectorFrameGroup> {
    configuration
        .streams
        .iter()
        .flat_map(|stream| {
            stream.frame_groups.iter().map(move |sequence| CollectorFrameGroup {
                stream_id: stream.id,
                sequence: sequence.clone(),
            })
        })
        .collect()
}

/// Destination of one raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFramesTo {
    /// Index into the frame group list.
    pub group: usize,
    /// Slot within that group.
    pub index: usize,
}

/// Instructions for one buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferAction {
    /// Destinations for each raw frame position in the buffer. A position
    /// can feed several groups; positions past the end are ignored.
    pub mapping: Vec<Vec<MapFramesTo>>,
    /// Groups whose last buffer this is.
    pub ready: Vec<usize>,
}

/// Actions keyed by the sequence index of a buffer's first raw frame.
pub type BufferActionMap = BTreeMap<u16, BufferAction>;

/// Result of [`calculate_actions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPlan {
    /// Per-buffer instructions.
    pub actions: BufferActionMap,
    /// Width of one transport buffer in pixels.
    pub buffer_width: u16,
    /// Height of one transport buffer in pixels, pseudodata rows included.
    pub buffer_height: u16,
    /// Buffers the transport should allocate.
    pub buffer_count: usize,
}

impl ActionPlan {
    /// Largest number of raw frames any one buffer carries.
    pub fn max_frames_per_buffer(&self) -> usize {
        self.actions
            .values()
            .map(|action| action.mapping.len())
            .max()
            .unwrap_or(0)
    }
}

/// Computes the buffer actions for a configuration.
///
/// `block_sizes` is only used in [`TransmissionMode::Superframe`]; each
/// entry is the number of raw frames in one buffer, in capture order.
pub fn calculate_actions(
    mode: TransmissionMode,
    configuration: &CaptureConfiguration,
    groups: &[CollectorFrameGroup],
    block_sizes: &[u16],
) -> Result<ActionPlan, PlanError> {
    if groups.is_empty() {
        return Err(PlanError::NoGroups);
    }
    let frame_height = configuration.image_height + 1;

    let (mut actions, blocks, buffer_height) = match mode {
        TransmissionMode::Individual => {
            let actions: BufferActionMap = (0..configuration.raw_frame_count)
                .map(|seq| {
                    (
                        seq,
                        BufferAction {
                            mapping: vec![Vec::new()],
                            ready: Vec::new(),
                        },
                    )
                })
                .collect();
            let blocks: Vec<(u16, u16)> = (0..configuration.raw_frame_count).map(|s| (s, 1)).collect();
            (actions, blocks, frame_height)
        }
        TransmissionMode::Superframe => {
            let mut blocks = Vec::with_capacity(block_sizes.len());
            let mut base = 0u16;
            for &size in block_sizes.iter().filter(|&&s| s > 0) {
                blocks.push((base, size));
                base += size;
            }
            let max_block = blocks.iter().map(|&(_, size)| size).max().ok_or(PlanError::EmptyBlockSizes)?;
            let actions: BufferActionMap = blocks
                .iter()
                .map(|&(base, size)| {
                    (
                        base,
                        BufferAction {
                            mapping: vec![Vec::new(); size as usize],
                            ready: Vec::new(),
                        },
                    )
                })
                .collect();
            (actions, blocks, frame_height * max_block)
        }
    };

    let buffer_of = |seq: u16| -> Result<(u16, usize), PlanError> {
        blocks
            .iter()
            .find(|&&(base, size)| seq >= base && seq < base + size)
            .map(|&(base, _)| (base, (seq - base) as usize))
            .ok_or(PlanError::SequenceOutOfRange(seq))
    };

    let mut buffers_per_stream: BTreeMap<StreamId, usize> = BTreeMap::new();
    for (g, group) in groups.iter().enumerate() {
        let mut touched = BTreeSet::new();
        for (index, &seq) in group.sequence.iter().enumerate() {
            let (buffer, position) = buffer_of(seq)?;
            touched.insert(buffer);
            if let Some(action) = actions.get_mut(&buffer) {
                action.mapping[position].push(MapFramesTo { group: g, index });
            }
        }
        if let Some(last) = touched.iter().next_back() {
            if let Some(action) = actions.get_mut(last) {
                action.ready.push(g);
            }
        }
        let needed = buffers_per_stream.entry(group.stream_id).or_default();
        *needed = (*needed).max(touched.len());
    }

    let buffer_count = buffers_per_stream.values().map(|n| 2 * n).sum();
    tracing::debug!(
        ?mode,
        buffers = actions.len(),
        buffer_count,
        "Calculated buffer actions"
    );

    Ok(ActionPlan {
        actions,
        buffer_width: configuration.image_width,
        buffer_height,
        buffer_count,
    })
}
