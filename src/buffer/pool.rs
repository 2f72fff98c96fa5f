//! Fixed-size arena of capture buffers shared by the acquisition thread and
//! whoever currently holds frames.

use super::{CapturedBuffer, PoolSlot};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised by [`BufferPool`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("buffers are already allocated ({0} in pool)")]
    AlreadyAllocated(usize),
    #[error("cannot allocate a pool of zero buffers")]
    ZeroCapacity,
    #[error("buffer in slot {0} was queued while already queued")]
    AlreadyQueued(usize),
    #[error("buffer does not belong to this pool")]
    ForeignBuffer,
    #[error("{outstanding} buffers were not returned in time")]
    BuffersInUse { outstanding: usize },
}

/// Return path for buffers once their last frame has been released.
pub trait BufferReleaser: Send + Sync {
    /// Takes a buffer back. Called exactly once per buffer handed out.
    fn release_buffer(&self, buffer: CapturedBuffer);
}

#[derive(Debug, Default)]
struct PoolState {
    generation: u64,
    capacity: usize,
    pixel_count: usize,
    free: VecDeque<CapturedBuffer>,
    queued: Vec<bool>,
    change_in_progress: bool,
    unblocked: bool,
}

/// Pool of equally sized [`CapturedBuffer`]s.
///
/// Buffers are allocated once per configuration and reused until the next
/// [`BufferPool::wait_dealloc`]. [`BufferPool::dequeue`] blocks with a
/// timeout so the acquisition thread can observe a stop request.
#[derive(Debug, Default)]
pub struct BufferPool {
    state: Mutex<PoolState>,
    available: Condvar,
    returned: Condvar,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates `count` buffers of `pixel_count` pixels each.
    ///
    /// Fails if buffers from an earlier allocation still exist.
    pub fn allocate(&self, count: usize, pixel_count: usize) -> Result<usize, PoolError> {
        if count == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        let mut state = self.state.lock();
        if state.capacity != 0 {
            return Err(PoolError::AlreadyAllocated(state.capacity));
        }
        state.generation += 1;
        let generation = state.generation;
        state.free = (0..count)
            .map(|index| CapturedBuffer::pooled(pixel_count, PoolSlot { index, generation }))
            .collect();
        state.queued = vec![true; count];
        state.capacity = count;
        state.pixel_count = pixel_count;
        tracing::debug!(count, pixel_count, generation, "Allocated capture buffers");
        drop(state);
        self.available.notify_all();
        Ok(count)
    }

    /// Takes a free buffer, waiting up to `timeout` for one to come back.
    ///
    /// Returns `None` on timeout, while the pool is being reallocated, or
    /// after [`BufferPool::unblock`].
    pub fn dequeue(&self, timeout: Duration) -> Option<CapturedBuffer> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.change_in_progress || state.unblocked {
                return None;
            }
            if let Some(buffer) = state.free.pop_front() {
                if let Some(slot) = buffer.slot() {
                    state.queued[slot.index] = false;
                }
                return Some(buffer);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Returns a buffer to the pool.
    ///
    /// A buffer from an earlier allocation is dropped quietly. Queueing a
    /// slot that is already queued is a logic error.
    pub fn queue_buffer(&self, buffer: CapturedBuffer) -> Result<(), PoolError> {
        let slot = buffer.slot().ok_or(PoolError::ForeignBuffer)?;
        let mut state = self.state.lock();
        if slot.generation != state.generation || slot.index >= state.capacity {
            tracing::debug!(
                slot = slot.index,
                generation = slot.generation,
                "Discarding buffer from an earlier allocation"
            );
            return Ok(());
        }
        if state.queued[slot.index] {
            tracing::error!(slot = slot.index, "Buffer queued twice");
            return Err(PoolError::AlreadyQueued(slot.index));
        }
        state.queued[slot.index] = true;
        state.free.push_back(buffer);
        let all_back = state.free.len() == state.capacity;
        drop(state);
        self.available.notify_one();
        if all_back {
            self.returned.notify_all();
        }
        Ok(())
    }

    /// Wakes every blocked [`BufferPool::dequeue`] and keeps it from blocking
    /// until [`BufferPool::resume`].
    pub fn unblock(&self) {
        self.state.lock().unblocked = true;
        self.available.notify_all();
    }

    /// Lets [`BufferPool::dequeue`] block again.
    pub fn resume(&self) {
        self.state.lock().unblocked = false;
    }

    /// Waits until every buffer has been returned, then frees them all.
    ///
    /// While waiting, [`BufferPool::dequeue`] hands out nothing. On timeout
    /// the pool is left allocated.
    pub fn wait_dealloc(&self, timeout: Duration) -> Result<(), PoolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.change_in_progress = true;
        self.available.notify_all();
        while state.free.len() != state.capacity {
            if self.returned.wait_until(&mut state, deadline).timed_out()
                && state.free.len() != state.capacity
            {
                let outstanding = state.capacity - state.free.len();
                state.change_in_progress = false;
                tracing::warn!(outstanding, "Capture buffers still in use");
                return Err(PoolError::BuffersInUse { outstanding });
            }
        }
        state.free.clear();
        state.queued.clear();
        state.capacity = 0;
        state.pixel_count = 0;
        state.change_in_progress = false;
        Ok(())
    }

    /// True while [`BufferPool::wait_dealloc`] is running.
    pub fn is_change_in_progress(&self) -> bool {
        self.state.lock().change_in_progress
    }

    /// Number of buffers allocated.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Pixels per buffer in the current allocation.
    pub fn pixel_count(&self) -> usize {
        self.state.lock().pixel_count
    }

    /// Number of buffers currently in the pool.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Number of buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.capacity - state.free.len()
    }
}

impl BufferReleaser for BufferPool {
    fn release_buffer(&self, buffer: CapturedBuffer) {
        if let Err(e) = self.queue_buffer(buffer) {
            tracing::error!(error = %e, "Failed to return buffer to pool");
        }
    }
}
