//! One capture session per camera connection.
//!
//! A [`CaptureSession`] owns the transport side ([`Reassembler`]) and the
//! [`FrameCollector`], wires the collector in as the reassembler's buffer
//! listener and returns buffers through the reassembler's pool. All mutable
//! capture state lives here; nothing is global.

use crate::collector::{
    CollectorConfig, CollectorError, ExecutedConfiguration, FrameCaptureListener, FrameCollector,
    TransmissionMode,
};
use crate::config::SessionConfig;
use crate::events::EventListener;
use crate::metrics::MetricsSnapshot;
use crate::transport::{BufferCaptureListener, PayloadSource, Reassembler, ReassemblerConfig, TransportError};
use crate::usecase::CaptureConfiguration;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by [`CaptureSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("collector error: {0}")]
    Collector(#[from] CollectorError),
}

/// Transport and collector of one connection.
pub struct CaptureSession {
    reassembler: Reassembler,
    collector: Arc<FrameCollector>,
}

impl CaptureSession {
    /// Creates an idle session; the collector's conveyance thread starts
    /// right away, acquisition only with [`CaptureSession::start`].
    pub fn new(
        reassembler: ReassemblerConfig,
        mode: TransmissionMode,
        collector: CollectorConfig,
    ) -> Result<Self, SessionError> {
        let reassembler = Reassembler::new(reassembler);
        let collector = Arc::new(FrameCollector::new(mode, reassembler.pool(), collector)?);
        reassembler.set_listener(Some(Arc::clone(&collector) as Arc<dyn BufferCaptureListener>));
        Ok(Self { reassembler, collector })
    }

    /// Creates a session from the file configuration.
    pub fn from_config(config: &SessionConfig) -> Result<Self, SessionError> {
        Self::new(
            config.reassembler.clone(),
            config.collector.mode,
            config.collector.settings.clone(),
        )
    }

    /// The frame collector.
    pub fn collector(&self) -> &Arc<FrameCollector> {
        &self.collector
    }

    /// The transport side.
    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Replaces the consumer of frame groups.
    pub fn set_listener(&self, listener: Option<Arc<dyn FrameCaptureListener>>) {
        self.collector.set_listener(listener);
    }

    /// Routes events of both threads to `listener`.
    pub fn set_event_listener(&self, listener: Option<Arc<dyn EventListener>>) {
        self.reassembler.set_event_listener(listener.clone());
        self.collector.set_event_listener(listener);
    }

    /// Attaches the device.
    pub fn open(&self, source: Box<dyn PayloadSource>) -> Result<(), SessionError> {
        self.reassembler.open_connection(source)?;
        Ok(())
    }

    /// Activates `configuration`. A running capture is stopped for the
    /// change and restarted afterwards.
    pub fn execute_configuration(
        &self,
        configuration: CaptureConfiguration,
        block_sizes: &[u16],
    ) -> Result<ExecutedConfiguration, SessionError> {
        let restart = self.reassembler.is_acquiring();
        if restart {
            self.reassembler.stop_capture()?;
        }
        let executed = self
            .collector
            .execute_configuration(&self.reassembler, configuration, block_sizes)?;
        if restart {
            self.reassembler.start_capture()?;
        }
        Ok(executed)
    }

    /// Starts acquisition.
    pub fn start(&self) -> Result<(), SessionError> {
        self.reassembler.start_capture()?;
        Ok(())
    }

    /// Stops acquisition. Frames already collected are still delivered.
    pub fn stop(&self) -> Result<(), SessionError> {
        self.reassembler.stop_capture()?;
        Ok(())
    }

    /// True while the acquisition thread runs.
    pub fn is_acquiring(&self) -> bool {
        self.reassembler.is_acquiring()
    }

    /// Stops acquisition, releases every held buffer and hands the device
    /// back.
    pub fn close(&self) -> Option<Box<dyn PayloadSource>> {
        let source = self.reassembler.close_connection();
        let released = self.collector.release_all_buffers();
        tracing::debug!(released, "Capture session closed");
        source
    }

    /// Current counters of both sides, for the metrics exporter.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let collector = self.collector.stats();
        let transport = self.reassembler.stats();
        MetricsSnapshot {
            acquiring: self.reassembler.is_acquiring(),
            raw_frames: collector.frames.total_frames,
            bridge_dropped: collector.frames.transport_dropped,
            collector_dropped: collector.frames.collector_dropped,
            groups_delivered: collector.groups_delivered,
            consumer_failures: collector.consumer_failures,
            queued_groups: collector.queued_groups,
            payloads: transport.payloads,
            corrupt_frames: transport.discarded,
            realignments: transport.realignments,
            buffer_starvations: transport.starvations,
            buffers_outstanding: self.reassembler.pool().outstanding(),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Err(e) = self.reassembler.stop_capture() {
            tracing::warn!(error = %e, "Stopping capture on drop failed");
        }
        self.reassembler.set_listener(None);
        self.collector.shutdown();
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("reassembler", &self.reassembler)
            .field("collector", &self.collector)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferDataFormat;
    use crate::collector::CallbackData;
    use crate::events::{Event, EventLog};
    use crate::transport::synthetic::SyntheticCamera;
    use crate::transport::{FramingConfig, HeaderFramingConfig, MarkerFramingConfig};
    use parking_lot::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Groups(Mutex<Vec<Vec<u16>>>);

    impl Groups {
        fn len(&self) -> usize {
            self.0.lock().len()
        }
    }

    impl FrameCaptureListener for Groups {
        fn capture_callback(&self, data: CallbackData) {
            let layout = &data.configuration.pseudo_data;
            self.0
                .lock()
                .push(data.frames.iter().map(|f| layout.frame_number(f.pseudo_data())).collect());
        }
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn session(framing: FramingConfig, mode: TransmissionMode) -> (CaptureSession, Arc<Groups>) {
        let session = CaptureSession::new(
            ReassemblerConfig {
                framing,
                ..Default::default()
            },
            mode,
            CollectorConfig::default(),
        )
        .unwrap();
        let groups = Arc::new(Groups::default());
        session.set_listener(Some(groups.clone() as Arc<dyn FrameCaptureListener>));
        (session, groups)
    }

    #[test]
    fn test_header_framed_session() {
        let configuration = CaptureConfiguration::single_stream(16, 4, 3);
        let header = HeaderFramingConfig::default();
        let (session, groups) = session(FramingConfig::Header(header.clone()), TransmissionMode::Individual);
        let camera = SyntheticCamera::header_framed(&header, BufferDataFormat::Raw12)
            .with_configuration(&configuration)
            .with_limit(9);

        session.open(Box::new(camera)).unwrap();
        let executed = session.execute_configuration(configuration, &[]).unwrap();
        assert_eq!(executed.buffer_count, 6);
        assert_eq!(executed.allocated, 6);

        session.start().unwrap();
        assert!(wait_until(|| groups.len() == 3));
        session.stop().unwrap();

        assert_eq!(*groups.0.lock(), vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8]]);
        let snapshot = session.metrics_snapshot();
        assert!(!snapshot.acquiring);
        assert_eq!(snapshot.raw_frames, 9);
        assert_eq!(snapshot.groups_delivered, 3);
        assert_eq!(snapshot.bridge_dropped, 0);
        assert!(wait_until(|| session.metrics_snapshot().buffers_outstanding == 0));
        assert!(session.close().is_some());
    }

    #[test]
    fn test_marker_framed_superframes_with_drop() {
        let configuration = CaptureConfiguration::single_stream(16, 4, 4);
        let marker = MarkerFramingConfig::default();
        let (session, groups) = session(FramingConfig::Marker(marker.clone()), TransmissionMode::Superframe);
        let log = Arc::new(EventLog::new());
        session.set_event_listener(Some(log.clone() as Arc<dyn EventListener>));
        // buffer 2 opens the second cycle and is lost
        let camera = SyntheticCamera::marker_framed(&marker)
            .with_configuration(&configuration)
            .with_blocks(vec![2, 2])
            .with_dropped_buffers([2])
            .with_limit(6)
            .disconnect_when_done();

        session.open(Box::new(camera)).unwrap();
        let executed = session.execute_configuration(configuration, &[2, 2]).unwrap();
        assert_eq!(executed.buffer_height, 10);

        session.start().unwrap();
        assert!(wait_until(|| !session.is_acquiring()));
        assert!(wait_until(|| groups.len() == 2));

        assert_eq!(*groups.0.lock(), vec![vec![0, 1, 2, 3], vec![8, 9, 10, 11]]);
        assert_eq!(log.count(|e| matches!(e, Event::DeviceDisconnected)), 1);
        let snapshot = session.metrics_snapshot();
        assert_eq!(snapshot.bridge_dropped, 2);
        assert_eq!(snapshot.collector_dropped, 2);
    }

    #[test]
    fn test_reconfigure_while_capturing_restarts() {
        let configuration = CaptureConfiguration::single_stream(16, 4, 1);
        let header = HeaderFramingConfig::default();
        let (session, groups) = session(FramingConfig::Header(header.clone()), TransmissionMode::Individual);
        let camera = SyntheticCamera::header_framed(&header, BufferDataFormat::Raw16)
            .with_configuration(&configuration)
            .with_interval(Duration::from_millis(1));

        session.open(Box::new(camera)).unwrap();
        session.execute_configuration(configuration.clone(), &[]).unwrap();
        session.start().unwrap();
        assert!(wait_until(|| groups.len() >= 3));

        session.execute_configuration(configuration, &[]).unwrap();
        assert!(session.is_acquiring());
        let before = groups.len();
        assert!(wait_until(|| groups.len() > before));
        assert!(session.close().is_some());
        assert!(!session.is_acquiring());
    }

    #[test]
    fn test_start_requires_configuration() {
        let (session, _groups) = session(FramingConfig::default(), TransmissionMode::Individual);
        assert!(matches!(
            session.start(),
            Err(SessionError::Transport(TransportError::NotConnected))
        ));
        let camera = SyntheticCamera::header_framed(&HeaderFramingConfig::default(), BufferDataFormat::Raw16);
        session.open(Box::new(camera)).unwrap();
        assert!(matches!(
            session.start(),
            Err(SessionError::Transport(TransportError::InvalidSize(_)))
        ));
    }

    #[test]
    fn test_from_config() {
        let config = SessionConfig::default();
        let session = CaptureSession::from_config(&config).unwrap();
        assert_eq!(session.collector().mode(), TransmissionMode::Individual);
        assert!(!session.reassembler().is_connected());
    }
}
