//! The frame collector.
//!
//! Buffers arrive on the acquisition thread through
//! [`FrameCollector::buffer_callback`]. Their raw frames are sorted into
//! frame group slots following the precomputed [`BufferAction`](super::BufferAction)s, gaps in
//! the frame numbers release groups that can no longer complete, and every
//! complete group is queued for the conveyance thread.
//!
//! Locks, in acquisition order:
//! 1. the execute lock, held for all of [`FrameCollector::execute_configuration`];
//!    intake only ever `try_lock`s it and returns its buffer if it is held;
//! 2. the buffer lock, guarding slots, frame tracking, exposure times and
//!    statistics.
//!
//! The listener lock lives in the conveyance state and is never taken while
//! the buffer lock is held. Statistics events are sent after the buffer
//! lock is released, so an event listener may query the collector.

use super::conveyance::{CallbackData, CaptureMetadata, Conveyance, ConveyanceItem, FrameCaptureListener};
use super::frame::{release_slots, BufferHolder, RawFrame};
use super::planner::{calculate_actions, collector_frame_groups, ActionPlan, CollectorFrameGroup, PlanError, TransmissionMode};
use super::stats::{CollectorStats, FrameCounters};
use crate::buffer::{BufferReleaser, CapturedBuffer};
use crate::events::{Event, EventForwarder, EventListener, RawFrameStats};
use crate::sequence::{following, fwd_distance, is_greater_frame, FRAME_NUMBER_MASK};
use crate::transport::{BridgeDataReceiver, BufferCaptureListener, TransportError};
use crate::usecase::{CaptureConfiguration, UsecaseError};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised by [`FrameCollector`].
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("frame collector has no configuration")]
    NotConfigured,
    #[error("frame collector received data during or after shutdown")]
    Stopped,
    #[error("buffer holds {pixels} pixels, {needed} needed for {frames} raw frames")]
    BufferTooSmall {
        pixels: usize,
        needed: usize,
        frames: usize,
    },
    #[error("expected {expected} exposure times, got {actual}")]
    ExposureCountMismatch { expected: usize, actual: usize },
    #[error("exposure change after frame {after} queued behind a later change at {last}")]
    ExposureOutOfOrder { after: u16, last: u16 },
    #[error("invalid configuration: {0}")]
    Usecase(#[from] UsecaseError),
    #[error("buffer planning failed: {0}")]
    Plan(#[from] PlanError),
    #[error("transport rejected the configuration: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to spawn conveyance thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Frame collector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Completed groups that may wait for the consumer before new ones are
    /// dropped.
    pub queue_capacity: usize,
    /// Upper bound on waiting for an in-progress delivery during a release.
    pub release_timeout_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            release_timeout_ms: 2000,
        }
    }
}

impl CollectorConfig {
    fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

/// Buffer geometry requested from the transport by
/// [`FrameCollector::execute_configuration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutedConfiguration {
    /// Buffer width in pixels.
    pub buffer_width: u16,
    /// Buffer height in pixels, pseudodata rows included.
    pub buffer_height: u16,
    /// Buffers requested.
    pub buffer_count: usize,
    /// Buffers the transport allocated.
    pub allocated: usize,
}

struct ActiveConfiguration {
    configuration: Arc<CaptureConfiguration>,
    groups: Vec<CollectorFrameGroup>,
    plan: Arc<ActionPlan>,
    pixels_per_frame: usize,
}

struct BufferState {
    active: Option<ActiveConfiguration>,
    captured: Vec<Vec<Option<RawFrame>>>,
    sequence_base: Option<u16>,
    next_expected_sequence: u16,
    last_frame_seen: Option<u16>,
    exposure_times: Vec<u32>,
    pending_exposures: VecDeque<(u16, Vec<u32>)>,
    counters: FrameCounters,
    due_stats: Vec<RawFrameStats>,
    stopped: bool,
}

impl BufferState {
    fn new() -> Self {
        Self {
            active: None,
            captured: Vec::new(),
            sequence_base: None,
            next_expected_sequence: 0,
            last_frame_seen: None,
            exposure_times: Vec::new(),
            pending_exposures: VecDeque::new(),
            counters: FrameCounters::default(),
            due_stats: Vec::new(),
            stopped: false,
        }
    }

    /// Releases every partially filled group; returns the frames released.
    fn release_partial_groups(&mut self) -> usize {
        let mut released = 0;
        let mut dropped = 0;
        for group in &mut self.captured {
            released += group.iter().filter(|slot| slot.is_some()).count();
            dropped += release_slots(group);
        }
        self.record(dropped, 0);
        released
    }

    /// Counts frames; a statistics window that fills up is kept in
    /// `due_stats` until the buffer lock is released.
    fn record(&mut self, dropped: u64, accepted: u64) {
        if let Some(stats) = self.counters.record(dropped, accepted) {
            self.due_stats.push(stats);
        }
    }

    fn update_frame_number(&mut self, frame_number: u16, frame_count: usize) {
        if let Some(last) = self.last_frame_seen {
            let distance = fwd_distance(frame_number, last);
            if distance > 1 && is_greater_frame(last, frame_number) {
                self.counters.record_transport_drops(u64::from(distance - 1));
            }
        }
        let span = (frame_count.max(1) - 1) as u16;
        self.last_frame_seen = Some(following(frame_number, span));
    }

    /// Applies pending exposure changes that the reconfiguration index
    /// shows to be in effect. Returns true if anything changed.
    fn check_for_reconfig(&mut self, reconfig_index: u16) -> bool {
        let mut changed = false;
        while let Some((after, _)) = self.pending_exposures.front() {
            if !is_greater_frame(*after, reconfig_index) {
                break;
            }
            if let Some((_, times)) = self.pending_exposures.pop_front() {
                self.exposure_times = times;
                changed = true;
            }
        }
        changed
    }
}

/// Turns a stream of captured buffers into a stream of frame groups.
pub struct FrameCollector {
    mode: TransmissionMode,
    config: CollectorConfig,
    releaser: Arc<dyn BufferReleaser>,
    execute_lock: Mutex<()>,
    state: Mutex<BufferState>,
    reconfig: Condvar,
    conveyance: Arc<Conveyance>,
    sender: Sender<ConveyanceItem>,
    receiver: Receiver<ConveyanceItem>,
    stop: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    events: Arc<EventForwarder>,
}

impl FrameCollector {
    /// Creates a collector and starts its conveyance thread.
    ///
    /// `releaser` takes buffers back once all their frames are released.
    pub fn new(
        mode: TransmissionMode,
        releaser: Arc<dyn BufferReleaser>,
        config: CollectorConfig,
    ) -> Result<Self, CollectorError> {
        let events = Arc::new(EventForwarder::new());
        let conveyance = Arc::new(Conveyance::new(Arc::clone(&events)));
        let (sender, receiver) = crossbeam_channel::bounded(config.queue_capacity.max(1));
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let thread = {
            let conveyance = Arc::clone(&conveyance);
            let receiver = receiver.clone();
            thread::Builder::new()
                .name("conveyance".into())
                .spawn(move || conveyance.run(receiver, stop_rx))?
        };

        Ok(Self {
            mode,
            config,
            releaser,
            execute_lock: Mutex::new(()),
            state: Mutex::new(BufferState::new()),
            reconfig: Condvar::new(),
            conveyance,
            sender,
            receiver,
            stop: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
            events,
        })
    }

    /// Transmission mode chosen at construction.
    #[inline]
    pub fn mode(&self) -> TransmissionMode {
        self.mode
    }

    /// Replaces the consumer. Waits for an in-progress delivery to finish.
    pub fn set_listener(&self, listener: Option<Arc<dyn FrameCaptureListener>>) {
        self.conveyance.set_listener(listener);
    }

    /// Replaces the event listener.
    pub fn set_event_listener(&self, listener: Option<Arc<dyn EventListener>>) {
        self.events.set_listener(listener);
    }

    /// Activates a configuration.
    ///
    /// Releases everything held for the previous configuration, recomputes
    /// frame groups and buffer actions, resets frame tracking, and asks the
    /// transport for matching buffers. `block_sizes` is used in superframe
    /// mode only.
    pub fn execute_configuration(
        &self,
        receiver: &dyn BridgeDataReceiver,
        configuration: CaptureConfiguration,
        block_sizes: &[u16],
    ) -> Result<ExecutedConfiguration, CollectorError> {
        let _execute = self.execute_lock.lock();
        if self.state.lock().stopped {
            return Err(CollectorError::Stopped);
        }

        configuration.verify()?;
        let groups = collector_frame_groups(&configuration);
        let plan = calculate_actions(self.mode, &configuration, &groups, block_sizes)?;

        self.release_all_buffers();

        let executed = ExecutedConfiguration {
            buffer_width: plan.buffer_width,
            buffer_height: plan.buffer_height,
            buffer_count: plan.buffer_count,
            allocated: 0,
        };

        {
            let mut state = self.state.lock();
            state.captured = groups.iter().map(|g| vec![None; g.sequence.len()]).collect();
            state.sequence_base = None;
            state.next_expected_sequence = 0;
            state.last_frame_seen = None;
            state.exposure_times = configuration.exposure_times.clone();
            state.pending_exposures.clear();
            state.counters = FrameCounters::new(configuration.frames_per_stats_event());
            state.active = Some(ActiveConfiguration {
                pixels_per_frame: configuration.pixels_per_raw_frame(),
                configuration: Arc::new(configuration),
                groups,
                plan: Arc::new(plan),
            });
        }
        self.reconfig.notify_all();

        let allocated = receiver.execute_configuration(
            executed.buffer_width,
            executed.buffer_height,
            executed.buffer_count,
        )?;
        if allocated < executed.buffer_count {
            tracing::warn!(
                requested = executed.buffer_count,
                allocated,
                "Transport allocated fewer buffers than requested"
            );
        }
        tracing::info!(
            mode = ?self.mode,
            width = executed.buffer_width,
            height = executed.buffer_height,
            buffers = allocated,
            "Frame collector configured"
        );

        Ok(ExecutedConfiguration {
            allocated,
            ..executed
        })
    }

    /// Intake of one captured buffer; called on the acquisition thread.
    ///
    /// Never waits for the consumer or for a configuration change: while
    /// one is in progress the buffer goes straight back to the pool.
    pub fn buffer_callback(&self, buffer: CapturedBuffer) -> Result<(), CollectorError> {
        let Some(_execute) = self.execute_lock.try_lock() else {
            tracing::debug!("Configuration change in progress, returning buffer");
            self.releaser.release_buffer(buffer);
            return Ok(());
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.stopped {
            drop(guard);
            self.releaser.release_buffer(buffer);
            tracing::error!("Buffer received after shutdown");
            return Err(CollectorError::Stopped);
        }
        let Some(active) = state.active.as_ref() else {
            drop(guard);
            self.releaser.release_buffer(buffer);
            tracing::error!("Buffer received before configuration");
            return Err(CollectorError::NotConfigured);
        };

        let configuration = Arc::clone(&active.configuration);
        let plan = Arc::clone(&active.plan);
        let pixels_per_frame = active.pixels_per_frame;
        let width = configuration.image_width as usize;
        let layout = &configuration.pseudo_data;

        if buffer.pixel_count() < pixels_per_frame {
            drop(guard);
            let pixels = buffer.pixel_count();
            self.releaser.release_buffer(buffer);
            return Err(CollectorError::BufferTooSmall {
                pixels,
                needed: pixels_per_frame,
                frames: 1,
            });
        }
        let pseudo = &buffer.pixels()[..width];
        let frame_number = layout.frame_number(pseudo);
        let sequence = layout.sequence_index(pseudo);
        let reconfig_index = layout.reconfig_index(pseudo);

        let Some(action) = plan.actions.get(&sequence) else {
            // Gaps this leaves are counted once a known frame arrives.
            tracing::warn!(sequence, frame_number, "No buffer action for sequence");
            drop(guard);
            self.releaser.release_buffer(buffer);
            return Ok(());
        };
        let frame_count = action.mapping.len();
        if buffer.pixel_count() < pixels_per_frame * frame_count {
            drop(guard);
            let pixels = buffer.pixel_count();
            self.releaser.release_buffer(buffer);
            tracing::error!(pixels, frame_count, "Buffer too small for its raw frames");
            return Err(CollectorError::BufferTooSmall {
                pixels,
                needed: pixels_per_frame * frame_count,
                frames: frame_count,
            });
        }

        let reset_sequence_base = match state.sequence_base {
            None => true,
            Some(base) => {
                // Also the normal path for the first buffer of every cycle:
                // its frame number is past the end of the previous cycle.
                let unexpected = frame_number != following(base, sequence)
                    && !is_greater_frame(frame_number, following(base, configuration.raw_frame_count));
                unexpected || sequence < state.next_expected_sequence
            }
        };

        if reset_sequence_base {
            state.release_partial_groups();
            state.sequence_base = Some(fwd_distance(frame_number, sequence));
        } else if sequence != state.next_expected_sequence {
            // Groups completed by the skipped buffers can never complete.
            let skipped: Vec<usize> = plan
                .actions
                .range(state.next_expected_sequence..sequence)
                .flat_map(|(_, action)| action.ready.iter().copied())
                .collect();
            self.process_ready_groups(state, &skipped);
        }

        state.next_expected_sequence = plan
            .actions
            .range((Bound::Excluded(sequence), Bound::Unbounded))
            .next()
            .map_or(0, |(&next, _)| next);

        state.update_frame_number(frame_number, frame_count);
        if state.check_for_reconfig(reconfig_index) {
            tracing::debug!(reconfig_index, exposure_times = ?state.exposure_times, "Exposure times updated");
            self.reconfig.notify_all();
        }

        let holder = Arc::new(BufferHolder::new(
            buffer,
            Arc::clone(&self.releaser),
            pixels_per_frame,
            width,
        ));
        debug_assert!(holder.frame_capacity() >= frame_count);
        for (position, targets) in action.mapping.iter().enumerate() {
            if targets.is_empty() {
                continue;
            }
            let frame = RawFrame::new(Arc::clone(&holder), position);
            for target in targets {
                let slot = &mut state.captured[target.group][target.index];
                if let Some(existing) = slot {
                    tracing::warn!(
                        existing = layout.frame_number(existing.pseudo_data()),
                        incoming = layout.frame_number(frame.pseudo_data()),
                        "Two frames mapped to the same destination"
                    );
                } else {
                    *slot = Some(frame.clone());
                }
            }
        }
        // returns the buffer right away if no frame was kept
        drop(holder);

        self.process_ready_groups(state, &action.ready);
        let due = std::mem::take(&mut state.due_stats);
        drop(guard);
        self.emit_due_stats(due);
        Ok(())
    }

    /// Moves each listed group that is complete into the conveyance queue
    /// and releases the ones that are not. Caller holds the buffer lock.
    fn process_ready_groups(&self, state: &mut BufferState, ready: &[usize]) {
        let BufferState {
            active,
            captured,
            exposure_times,
            counters,
            due_stats,
            ..
        } = state;
        let Some(active) = active.as_ref() else {
            return;
        };
        let layout = &active.configuration.pseudo_data;

        for &g in ready {
            let expected = &active.groups[g].sequence;
            let collected = &mut captured[g];
            let complete = collected.len() == expected.len()
                && collected.iter().zip(expected).all(|(slot, &seq)| {
                    slot.as_ref()
                        .is_some_and(|frame| layout.sequence_index(frame.pseudo_data()) == seq)
                });

            if !complete {
                let dropped = release_slots(collected);
                if dropped > 0 {
                    tracing::debug!(group = g, dropped, "Released incomplete frame group");
                }
                due_stats.extend(counters.record(dropped, 0));
                continue;
            }

            let frames: Vec<RawFrame> = collected.iter_mut().filter_map(Option::take).collect();
            let metadata = group_metadata(&frames, layout, exposure_times);
            let newly_accepted = frames.iter().filter(|f| f.mark_delivered()).count() as u64;
            let frame_count = frames.len();
            let data = CallbackData {
                frames,
                configuration: Arc::clone(&active.configuration),
                stream_id: active.groups[g].stream_id,
                metadata,
            };

            let stats = match self.sender.try_send(ConveyanceItem::Deliver(data)) {
                Ok(()) => counters.record(0, newly_accepted),
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    tracing::warn!(group = g, frame_count, "Conveyance queue full, dropping frame group");
                    counters.record(newly_accepted, 0)
                }
            };
            due_stats.extend(stats);
        }
    }

    /// Sends statistics windows that filled up while the buffer lock was
    /// held. Must be called without the buffer lock.
    fn emit_due_stats(&self, due: Vec<RawFrameStats>) {
        for stats in due {
            self.events.emit(Event::RawFrameStats(stats));
        }
    }

    /// Returns every frame the collector holds to the transport pool.
    ///
    /// Releases partial groups, waits for an in-progress delivery, calls the
    /// consumer's release hook, then empties the conveyance queue. Returns
    /// the number of raw frame references released; a second call in a row
    /// returns zero.
    pub fn release_all_buffers(&self) -> usize {
        let (mut released, stopped) = {
            let mut state = self.state.lock();
            let released = state.release_partial_groups();
            let due = std::mem::take(&mut state.due_stats);
            let stopped = state.stopped;
            drop(state);
            self.emit_due_stats(due);
            (released, stopped)
        };

        self.conveyance.begin_drain();
        // from inside a consumer callback the delivery in progress is our caller
        if !stopped && !self.conveyance.is_conveyance_thread() {
            self.wait_for_conveyance();
        }
        self.conveyance.release_all_frames();
        for item in self.receiver.try_iter() {
            match item {
                ConveyanceItem::Deliver(data) => self.conveyance.discard(data),
                other => self.conveyance.handle(other),
            }
        }
        released += self.conveyance.end_drain();

        {
            let mut state = self.state.lock();
            state.pending_exposures.clear();
        }
        self.reconfig.notify_all();

        if released > 0 {
            tracing::debug!(released, "Released all buffers");
        }
        released
    }

    fn wait_for_conveyance(&self) {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        let timeout = self.config.release_timeout();
        if self
            .sender
            .send_timeout(ConveyanceItem::Barrier(ack_tx), timeout)
            .is_err()
            || ack_rx.recv_timeout(timeout).is_err()
        {
            tracing::warn!("Conveyance thread did not acknowledge release in time");
        }
    }

    /// Queues exposure times to report once the reconfiguration index moves
    /// past `after_reconfig_index`.
    pub fn set_reported_exposure_times(
        &self,
        after_reconfig_index: u16,
        times: Vec<u32>,
    ) -> Result<(), CollectorError> {
        let after = after_reconfig_index & FRAME_NUMBER_MASK;
        let mut state = self.state.lock();
        let Some(active) = state.active.as_ref() else {
            return Err(CollectorError::NotConfigured);
        };
        let expected = active.configuration.exposure_times.len();
        if times.len() != expected {
            tracing::error!(expected, actual = times.len(), "Wrong number of exposure times");
            return Err(CollectorError::ExposureCountMismatch {
                expected,
                actual: times.len(),
            });
        }
        if let Some(&(last, _)) = state.pending_exposures.back() {
            if is_greater_frame(after, last) {
                tracing::error!(after, last, "Exposure changes queued out of order");
                return Err(CollectorError::ExposureOutOfOrder { after, last });
            }
        }
        state.pending_exposures.push_back((after, times));
        Ok(())
    }

    /// Waits until every queued exposure change has been observed.
    ///
    /// Returns false if `timeout` passed first.
    pub fn sync_reported_exposure_times(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.pending_exposures.is_empty() {
            if self.reconfig.wait_until(&mut state, deadline).timed_out() {
                return state.pending_exposures.is_empty();
            }
        }
        true
    }

    /// True while exposure changes are waiting to be observed.
    pub fn pending_reported_exposure_times(&self) -> bool {
        !self.state.lock().pending_exposures.is_empty()
    }

    /// Exposure times currently reported with delivered groups.
    pub fn reported_exposure_times(&self) -> Vec<u32> {
        self.state.lock().exposure_times.clone()
    }

    /// Returns the raw frame counters since the previous flush, optionally
    /// emitting them as a [`Event::RawFrameStats`] event.
    pub fn flush_raw_frame_statistics(&self, emit: bool) -> RawFrameStats {
        let stats = self.state.lock().counters.flush();
        if emit {
            self.events.emit(Event::RawFrameStats(stats));
        }
        stats
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            frames: self.state.lock().counters.totals(),
            groups_delivered: self.conveyance.delivered(),
            consumer_failures: self.conveyance.failures(),
            queued_groups: self.receiver.len(),
        }
    }

    /// Stops the conveyance thread and releases everything still held.
    ///
    /// Later calls to [`FrameCollector::buffer_callback`] fail.
    pub fn shutdown(&self) {
        let due = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.release_partial_groups();
            state.pending_exposures.clear();
            std::mem::take(&mut state.due_stats)
        };
        self.reconfig.notify_all();
        self.emit_due_stats(due);

        drop(self.stop.lock().take());
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Conveyance thread panicked");
            }
        }
        for item in self.receiver.try_iter() {
            self.conveyance.handle(item);
        }
        self.conveyance.release_all_frames();
        tracing::debug!("Frame collector shut down");
    }
}

fn group_metadata(
    frames: &[RawFrame],
    layout: &crate::sequence::PseudoDataLayout,
    exposure_times: &[u32],
) -> CaptureMetadata {
    let first = frames.first().map_or(0, RawFrame::timestamp_us);
    let last = frames.last().map_or(0, RawFrame::timestamp_us);
    let timestamp_us = if first != 0 && last != 0 {
        first / 2 + last / 2 + (first % 2 + last % 2) / 2
    } else {
        chrono::Utc::now().timestamp_micros().max(0) as u64
    };
    CaptureMetadata {
        timestamp_us,
        temperature: frames.first().and_then(|f| layout.temperature(f.pseudo_data())),
        exposure_times: exposure_times.to_vec(),
    }
}

impl BufferCaptureListener for FrameCollector {
    fn buffer_callback(&self, buffer: CapturedBuffer) {
        if let Err(e) = FrameCollector::buffer_callback(self, buffer) {
            tracing::error!(error = %e, "Frame collector rejected buffer");
        }
    }

    fn release_all_buffers(&self) {
        FrameCollector::release_all_buffers(self);
    }
}

impl Drop for FrameCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FrameCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCollector")
            .field("mode", &self.mode)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
