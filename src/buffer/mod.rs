//! Pixel buffers and the pool they circulate through.
//!
//! A [`CapturedBuffer`] is owned by exactly one party at a time: the
//! [`BufferPool`], the reassembler filling it, the frame collector, or the
//! consumer holding frames that point into it. Ownership moves with the
//! value, so a buffer can only be returned to its pool once.

mod captured;
mod normalize;
mod pool;

pub use captured::{BufferDataFormat, CapturedBuffer, PoolSlot};
pub use normalize::{
    copy_and_normalize_chunks, normalize_into, pack_raw12, pack_raw16, NormalizeError,
    PIXEL_MASK,
};
pub use pool::{BufferPool, BufferReleaser, PoolError};
