//! Asynchronous notifications from the capture path.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// How serious a reported condition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational.
    Info,
    /// Capture continues, possibly with lost frames.
    Warning,
    /// Capture stopped or a component failed.
    Error,
}

/// Raw frame counters accumulated since the previous flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFrameStats {
    /// Raw frames accounted for: delivered, dropped by the transport or
    /// dropped by the collector.
    pub total_frames: u64,
    /// Gaps in the frame numbers seen by the collector.
    pub transport_dropped: u64,
    /// Frames that reached the collector but were never delivered.
    pub collector_dropped: u64,
}

/// Event delivered to an [`EventListener`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The device went away; acquisition has stopped.
    DeviceDisconnected,
    /// A problem in the capture stream.
    CaptureStream {
        /// Severity of the problem.
        severity: Severity,
        /// Human readable description.
        message: String,
    },
    /// Periodic frame statistics.
    RawFrameStats(RawFrameStats),
    /// The acquisition thread found no free buffer.
    BufferStarvation,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::DeviceDisconnected => write!(f, "device disconnected"),
            Event::CaptureStream { severity, message } => write!(f, "{:?}: {}", severity, message),
            Event::RawFrameStats(stats) => write!(
                f,
                "raw frames: {} total, {} dropped by transport, {} dropped by collector",
                stats.total_frames, stats.transport_dropped, stats.collector_dropped
            ),
            Event::BufferStarvation => write!(f, "no free capture buffer"),
        }
    }
}

/// Receives capture events. Called from capture threads, so it must return
/// quickly.
pub trait EventListener: Send + Sync {
    /// Handles one event.
    fn on_event(&self, event: Event);
}

/// Holds the current event listener and forwards events to it.
#[derive(Default)]
pub struct EventForwarder {
    listener: Mutex<Option<Arc<dyn EventListener>>>,
}

impl EventForwarder {
    /// Creates a forwarder without a listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the listener; `None` detaches it.
    pub fn set_listener(&self, listener: Option<Arc<dyn EventListener>>) {
        *self.listener.lock() = listener;
    }

    /// Sends an event to the listener, if one is attached.
    pub fn emit(&self, event: Event) {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => listener.on_event(event),
            None => tracing::trace!(%event, "Event without listener"),
        }
    }

    /// Shorthand for a [`Event::CaptureStream`] event.
    pub fn capture_stream(&self, severity: Severity, message: impl Into<String>) {
        self.emit(Event::CaptureStream {
            severity,
            message: message.into(),
        });
    }
}

impl fmt::Debug for EventForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventForwarder")
            .field("has_listener", &self.listener.lock().is_some())
            .finish()
    }
}

/// Listener that stores every event; handy in tests and demos.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the events received so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Number of events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl EventListener for EventLog {
    fn on_event(&self, event: Event) {
        self.events.lock().push(event);
    }
}
