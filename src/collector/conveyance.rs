//! Delivery of completed frame groups on the conveyance thread.
//!
//! The intake path pushes [`CallbackData`] into a bounded channel and never
//! waits for the consumer. The conveyance thread pops one item at a time
//! and calls the consumer while holding only the listener lock. The lock
//! is reentrant: a consumer may replace the listener or release all
//! buffers from inside its callback.

use super::RawFrame;
use crate::events::{EventForwarder, Severity};
use crate::usecase::{CaptureConfiguration, StreamId};
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Per-group capture metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureMetadata {
    /// Capture time in microseconds: the average of the first and last
    /// frame's hardware timestamps, or the wall clock if those are unknown.
    pub timestamp_us: u64,
    /// Sensor temperature in degrees Celsius, if reported.
    pub temperature: Option<f32>,
    /// Exposure times in effect for the group, in microseconds.
    pub exposure_times: Vec<u32>,
}

/// One completed frame group handed to the consumer.
#[derive(Debug, Clone)]
pub struct CallbackData {
    /// Raw frames of the group, in slot order.
    pub frames: Vec<RawFrame>,
    /// Configuration that produced the frames.
    pub configuration: Arc<CaptureConfiguration>,
    /// Stream the group belongs to.
    pub stream_id: StreamId,
    /// Capture metadata.
    pub metadata: CaptureMetadata,
}

/// Consumer of completed frame groups.
pub trait FrameCaptureListener: Send + Sync {
    /// Receives one completed group. Runs on the conveyance thread.
    ///
    /// Frames go back to the pool when the last handle is dropped; the
    /// consumer may keep them past the end of the call. A panic here is
    /// caught and counted, and delivery continues with the next group.
    fn capture_callback(&self, data: CallbackData);

    /// Asks the consumer to drop every frame it still holds. Must return
    /// promptly.
    fn release_all_frames(&self) {}
}

pub(crate) enum ConveyanceItem {
    Deliver(CallbackData),
    Barrier(Sender<()>),
}

/// State shared between the collector and its conveyance thread.
pub(crate) struct Conveyance {
    listener: ReentrantMutex<RefCell<Option<Arc<dyn FrameCaptureListener>>>>,
    thread: Mutex<Option<ThreadId>>,
    draining: AtomicBool,
    discarded_frames: AtomicUsize,
    delivered: AtomicU64,
    failures: AtomicU64,
    events: Arc<EventForwarder>,
}

impl Conveyance {
    pub(crate) fn new(events: Arc<EventForwarder>) -> Self {
        Self {
            listener: ReentrantMutex::new(RefCell::new(None)),
            thread: Mutex::new(None),
            draining: AtomicBool::new(false),
            discarded_frames: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            events,
        }
    }

    /// Swaps the listener; waits for an in-progress delivery to finish.
    pub(crate) fn set_listener(&self, listener: Option<Arc<dyn FrameCaptureListener>>) {
        let guard = self.listener.lock();
        guard.replace(listener);
    }

    fn current_listener(&self) -> Option<Arc<dyn FrameCaptureListener>> {
        self.listener.lock().borrow().clone()
    }

    /// True when called from the conveyance thread, i.e. from inside a
    /// consumer callback.
    pub(crate) fn is_conveyance_thread(&self) -> bool {
        *self.thread.lock() == Some(thread::current().id())
    }

    /// Starts discarding instead of delivering.
    pub(crate) fn begin_drain(&self) {
        self.discarded_frames.store(0, Ordering::Release);
        self.draining.store(true, Ordering::Release);
    }

    /// Resumes delivery; returns the frames discarded meanwhile.
    pub(crate) fn end_drain(&self) -> usize {
        self.draining.store(false, Ordering::Release);
        self.discarded_frames.swap(0, Ordering::AcqRel)
    }

    /// Calls the consumer's release hook under the listener lock.
    pub(crate) fn release_all_frames(&self) {
        let _guard = self.listener.lock();
        if let Some(listener) = self.current_listener() {
            listener.release_all_frames();
        }
    }

    pub(crate) fn discard(&self, data: CallbackData) {
        self.discarded_frames
            .fetch_add(data.frames.len(), Ordering::AcqRel);
    }

    pub(crate) fn handle(&self, item: ConveyanceItem) {
        match item {
            ConveyanceItem::Deliver(data) => self.deliver(data),
            ConveyanceItem::Barrier(ack) => {
                // the waiter may have given up already
                let _ = ack.send(());
            }
        }
    }

    fn deliver(&self, data: CallbackData) {
        if self.draining.load(Ordering::Acquire) {
            self.discard(data);
            return;
        }
        // held for the whole call, so a listener swap waits for it
        let guard = self.listener.lock();
        if self.draining.load(Ordering::Acquire) {
            // a release-all started while we waited for the listener
            self.discard(data);
            return;
        }
        let Some(listener) = self.current_listener() else {
            tracing::trace!(stream = %data.stream_id, "No listener, dropping group");
            return;
        };

        let stream = data.stream_id;
        let result = panic::catch_unwind(AssertUnwindSafe(|| listener.capture_callback(data)));
        drop(guard);
        match result {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(stream = %stream, %reason, "Frame capture listener panicked");
                self.events.capture_stream(
                    Severity::Warning,
                    format!("frame capture listener failed: {}", reason),
                );
            }
        }
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub(crate) fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Conveyance thread body. Runs until `stop` is closed, then discards
    /// whatever is still queued.
    pub(crate) fn run(self: Arc<Self>, items: Receiver<ConveyanceItem>, stop: Receiver<()>) {
        *self.thread.lock() = Some(thread::current().id());
        tracing::debug!("Conveyance thread started");
        loop {
            select! {
                recv(items) -> item => match item {
                    Ok(item) => self.handle(item),
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            }
        }
        self.draining.store(true, Ordering::Release);
        for item in items.try_iter() {
            self.handle(item);
        }
        tracing::debug!("Conveyance thread stopped");
    }
}
