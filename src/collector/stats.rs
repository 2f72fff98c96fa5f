//! Raw frame accounting.

use crate::events::RawFrameStats;

/// Counters accumulated under the collector's buffer lock.
///
/// Each raw frame is accounted once: as accepted when the first group
/// containing it is queued for delivery, as dropped when its last slot is
/// released undelivered, or as a transport drop when its frame number was
/// never seen.
#[derive(Debug, Default)]
pub(crate) struct FrameCounters {
    accepted: u64,
    dropped: u64,
    transport_dropped: u64,
    frames_per_event: u64,
    totals: RawFrameStats,
}

impl FrameCounters {
    pub(crate) fn new(frames_per_event: usize) -> Self {
        Self {
            frames_per_event: frames_per_event as u64,
            ..Default::default()
        }
    }

    /// Adds collector drops and accepted frames.
    ///
    /// Returns the flushed counters when a statistics event is due.
    pub(crate) fn record(&mut self, dropped: u64, accepted: u64) -> Option<RawFrameStats> {
        self.dropped += dropped;
        self.accepted += accepted;
        self.totals.collector_dropped += dropped;
        self.totals.total_frames += dropped + accepted;
        let seen = self.accepted + self.dropped + self.transport_dropped;
        (self.frames_per_event > 0 && seen >= self.frames_per_event).then(|| self.flush())
    }

    /// Adds frames lost before they reached the collector.
    pub(crate) fn record_transport_drops(&mut self, count: u64) {
        self.transport_dropped += count;
        self.totals.transport_dropped += count;
        self.totals.total_frames += count;
    }

    /// Returns the counters since the previous flush and resets them.
    pub(crate) fn flush(&mut self) -> RawFrameStats {
        let stats = RawFrameStats {
            total_frames: self.accepted + self.dropped + self.transport_dropped,
            transport_dropped: self.transport_dropped,
            collector_dropped: self.dropped,
        };
        self.accepted = 0;
        self.dropped = 0;
        self.transport_dropped = 0;
        stats
    }

    /// Counters since the collector was configured.
    pub(crate) fn totals(&self) -> RawFrameStats {
        self.totals
    }
}

/// Cumulative collector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    /// Raw frame counters since the last configuration change.
    pub frames: RawFrameStats,
    /// Groups handed to the consumer.
    pub groups_delivered: u64,
    /// Groups whose delivery panicked in the consumer.
    pub consumer_failures: u64,
    /// Groups queued for delivery and not yet handled.
    pub queued_groups: usize,
}
