//! Collector scenarios driven with rendered buffers.

use super::*;
use crate::buffer::{BufferReleaser, CapturedBuffer};
use crate::events::{Event, EventListener, EventLog, RawFrameStats, Severity};
use crate::transport::synthetic::render_raw_frame;
use crate::transport::{BridgeDataReceiver, TransportError};
use crate::usecase::{CaptureConfiguration, StreamConfig, StreamId};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing_test::traced_test;

const WIDTH: u16 = 16;
const HEIGHT: u16 = 4;

#[derive(Default)]
struct CountingReleaser {
    returned: AtomicUsize,
}

impl CountingReleaser {
    fn returned(&self) -> usize {
        self.returned.load(Ordering::SeqCst)
    }
}

impl BufferReleaser for CountingReleaser {
    fn release_buffer(&self, _buffer: CapturedBuffer) {
        self.returned.fetch_add(1, Ordering::SeqCst);
    }
}

struct AcceptAll;

impl BridgeDataReceiver for AcceptAll {
    fn execute_configuration(&self, _width: u16, _height: u16, buffer_count: usize) -> Result<usize, TransportError> {
        Ok(buffer_count)
    }
}

#[derive(Debug, Clone)]
struct Delivered {
    stream: StreamId,
    frame_numbers: Vec<u16>,
    exposure_times: Vec<u32>,
    timestamp_us: u64,
    temperature: Option<f32>,
    images: Vec<Vec<u16>>,
}

#[derive(Default)]
struct Recorder {
    delivered: Mutex<Vec<Delivered>>,
    calls: AtomicUsize,
    releases: AtomicUsize,
    panic_on: Option<usize>,
}

impl Recorder {
    fn panicking_on(call: usize) -> Self {
        Self {
            panic_on: Some(call),
            ..Default::default()
        }
    }

    fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().clone()
    }

    fn count(&self, stream: StreamId) -> usize {
        self.delivered.lock().iter().filter(|d| d.stream == stream).count()
    }
}

impl FrameCaptureListener for Recorder {
    fn capture_callback(&self, data: CallbackData) {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on == Some(call) {
            panic!("consumer rejected group {}", call);
        }
        let layout = &data.configuration.pseudo_data;
        self.delivered.lock().push(Delivered {
            stream: data.stream_id,
            frame_numbers: data.frames.iter().map(|f| layout.frame_number(f.pseudo_data())).collect(),
            exposure_times: data.metadata.exposure_times.clone(),
            timestamp_us: data.metadata.timestamp_us,
            temperature: data.metadata.temperature,
            images: data.frames.iter().map(|f| f.image_data().to_vec()).collect(),
        });
    }

    fn release_all_frames(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    collector: Arc<FrameCollector>,
    releaser: Arc<CountingReleaser>,
    configuration: CaptureConfiguration,
    capacity_frames: usize,
    fed: usize,
}

impl Harness {
    fn new(
        mode: TransmissionMode,
        configuration: CaptureConfiguration,
        block_sizes: &[u16],
        listener: Arc<dyn FrameCaptureListener>,
    ) -> Self {
        Self::with_config(mode, configuration, block_sizes, listener, CollectorConfig {
            queue_capacity: 256,
            ..Default::default()
        })
    }

    fn with_config(
        mode: TransmissionMode,
        configuration: CaptureConfiguration,
        block_sizes: &[u16],
        listener: Arc<dyn FrameCaptureListener>,
        config: CollectorConfig,
    ) -> Self {
        let releaser = Arc::new(CountingReleaser::default());
        let collector = Arc::new(FrameCollector::new(mode, releaser.clone(), config).unwrap());
        collector.set_listener(Some(listener));
        let executed = collector
            .execute_configuration(&AcceptAll, configuration.clone(), block_sizes)
            .unwrap();
        let capacity_frames = (executed.buffer_height / (HEIGHT + 1)) as usize;
        Self {
            collector,
            releaser,
            configuration,
            capacity_frames,
            fed: 0,
        }
    }

    fn buffer(&self, frames: &[(u16, u16)], reconfig_index: u16) -> CapturedBuffer {
        let frame_pixels = self.configuration.pixels_per_raw_frame();
        let mut pixels = vec![0u16; frame_pixels * self.capacity_frames.max(frames.len())];
        for (k, &(frame_number, sequence)) in frames.iter().enumerate() {
            render_raw_frame(
                &mut pixels[k * frame_pixels..(k + 1) * frame_pixels],
                WIDTH as usize,
                &self.configuration.pseudo_data,
                frame_number,
                sequence,
                reconfig_index,
            );
        }
        let mut buffer = CapturedBuffer::from_pixels(pixels);
        buffer.set_timestamp_us(1000 + frames.first().map_or(0, |&(n, _)| n as u64));
        buffer
    }

    fn feed(&mut self, frames: &[(u16, u16)], reconfig_index: u16) {
        let buffer = self.buffer(frames, reconfig_index);
        self.fed += 1;
        self.collector.buffer_callback(buffer).unwrap();
    }

    /// Feeds frame numbers `from..to` one per buffer.
    fn feed_individual(&mut self, from: u16, to: u16, reconfig_index: u16) {
        let count = self.configuration.raw_frame_count;
        for frame_number in from..to {
            self.feed(&[(frame_number, frame_number % count)], reconfig_index);
        }
    }

    fn wait_for_groups(&self, count: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = self.collector.stats();
            if stats.groups_delivered + stats.consumer_failures >= count || Instant::now() > deadline {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn single_stream(group_size: u16) -> CaptureConfiguration {
    CaptureConfiguration::single_stream(WIDTH, HEIGHT, group_size)
}

fn mixed_mode() -> CaptureConfiguration {
    let mut configuration = CaptureConfiguration::single_stream(WIDTH, HEIGHT, 14);
    configuration.streams = vec![
        StreamConfig {
            id: StreamId(0xa),
            frame_groups: (0..5).map(|i| vec![i * 2, i * 2 + 1]).collect(),
        },
        StreamConfig {
            id: StreamId(0xb),
            frame_groups: vec![vec![10, 11, 12, 13]],
        },
    ];
    configuration
}

#[test]
fn test_groups_delivered_in_order() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Individual, single_stream(5), &[], recorder.clone());

    harness.feed_individual(0, 20, 0);
    harness.wait_for_groups(4);

    let delivered = recorder.delivered();
    assert_eq!(delivered.len(), 4);
    for (g, group) in delivered.iter().enumerate() {
        let first = g as u16 * 5;
        assert_eq!(group.frame_numbers, (first..first + 5).collect::<Vec<_>>());
        assert_eq!(group.stream, StreamId(0xdefa));
        assert_eq!(group.exposure_times, vec![200, 1000]);
        assert_eq!(group.temperature, Some(25.0));
        // average of the first and last buffer timestamps
        assert_eq!(group.timestamp_us, 1000 + first as u64 + 2);
    }
    assert_eq!(harness.releaser.returned(), harness.fed);

    let stats = harness.collector.stats();
    assert_eq!(stats.frames.total_frames, 20);
    assert_eq!(stats.frames.transport_dropped, 0);
    assert_eq!(stats.frames.collector_dropped, 0);
}

#[test]
fn test_executed_configuration_geometry() {
    let releaser = Arc::new(CountingReleaser::default());
    let collector = FrameCollector::new(TransmissionMode::Superframe, releaser, CollectorConfig::default()).unwrap();
    let executed = collector
        .execute_configuration(&AcceptAll, single_stream(9), &[5, 0, 4])
        .unwrap();
    assert_eq!(
        executed,
        ExecutedConfiguration {
            buffer_width: WIDTH,
            buffer_height: (HEIGHT + 1) * 5,
            buffer_count: 4,
            allocated: 4,
        }
    );
}

#[test]
fn test_dropped_group_is_counted_by_transport() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Individual, single_stream(5), &[], recorder.clone());

    harness.feed_individual(0, 5, 0);
    // frames 5..10 never arrive
    harness.feed_individual(10, 20, 0);
    harness.wait_for_groups(3);

    let delivered = recorder.delivered();
    assert_eq!(delivered.len(), 3);
    assert_eq!(delivered[1].frame_numbers, vec![10, 11, 12, 13, 14]);

    let stats = harness.collector.stats().frames;
    assert_eq!(stats.transport_dropped, 5);
    assert_eq!(stats.collector_dropped, 0);
    assert_eq!(stats.total_frames, 20);
}

#[test]
fn test_gap_inside_group_drops_group() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Individual, single_stream(5), &[], recorder.clone());

    harness.feed_individual(0, 7, 0);
    harness.feed_individual(8, 15, 0);
    harness.wait_for_groups(2);

    let delivered = recorder.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[1].frame_numbers, vec![10, 11, 12, 13, 14]);

    let stats = harness.collector.stats().frames;
    assert_eq!(stats.transport_dropped, 1);
    assert_eq!(stats.collector_dropped, 4);
    assert_eq!(harness.releaser.returned(), harness.fed);
}

#[test]
fn test_release_all_is_idempotent() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Individual, single_stream(5), &[], recorder.clone());
    let releases = recorder.releases.load(Ordering::SeqCst);

    harness.feed_individual(0, 3, 0);
    assert_eq!(harness.releaser.returned(), 0);

    assert_eq!(harness.collector.release_all_buffers(), 3);
    assert_eq!(harness.releaser.returned(), 3);
    assert_eq!(recorder.releases.load(Ordering::SeqCst), releases + 1);
    assert_eq!(harness.collector.release_all_buffers(), 0);
    assert!(recorder.delivered().is_empty());

    // the partial group is gone; the next complete cycle still arrives
    harness.feed_individual(5, 10, 0);
    harness.wait_for_groups(1);
    assert_eq!(recorder.delivered()[0].frame_numbers, vec![5, 6, 7, 8, 9]);
}

#[test]
fn test_underfilled_superframe_completes() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Superframe, single_stream(9), &[5, 4], recorder.clone());
    assert_eq!(harness.capacity_frames, 5);

    harness.feed(&[(0, 0), (1, 1), (2, 2), (3, 3), (4, 4)], 0);
    // four frames in a buffer sized for five
    harness.feed(&[(5, 5), (6, 6), (7, 7), (8, 8)], 0);
    harness.wait_for_groups(1);

    let delivered = recorder.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].frame_numbers, (0..9).collect::<Vec<_>>());
    assert_eq!(harness.releaser.returned(), 2);
}

#[test]
fn test_superframe_padded_to_bigger_block() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Superframe, single_stream(5), &[9], recorder.clone());
    assert_eq!(harness.capacity_frames, 9);

    for cycle in 0..10u16 {
        let base = cycle * 5;
        let mut frames: Vec<(u16, u16)> = (0..5).map(|s| (base + s, s)).collect();
        // trailing slots the camera fills with blank frames
        frames.extend([(0, 0); 4]);
        harness.feed(&frames, 0);
    }
    harness.wait_for_groups(10);

    let delivered = recorder.delivered();
    assert_eq!(delivered.len(), 10);
    for (cycle, group) in delivered.iter().enumerate() {
        let base = cycle as u16 * 5;
        assert_eq!(group.frame_numbers, (base..base + 5).collect::<Vec<_>>());
    }
    let stats = harness.collector.stats();
    assert_eq!(stats.frames.total_frames, 50);
    assert_eq!(stats.frames.transport_dropped, 0);
    assert_eq!(stats.frames.collector_dropped, 0);
    assert_eq!(harness.releaser.returned(), 10);
}

#[test]
fn test_individual_buffers_padded_to_superframe_size() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Individual, single_stream(5), &[], recorder.clone());
    assert_eq!(harness.capacity_frames, 1);

    for frame_number in 0..10u16 {
        let mut frames = vec![(frame_number, frame_number % 5)];
        frames.extend([(0, 0); 8]);
        harness.feed(&frames, 0);
    }
    harness.wait_for_groups(2);

    let delivered = recorder.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].frame_numbers, vec![0, 1, 2, 3, 4]);
    assert_eq!(delivered[1].frame_numbers, vec![5, 6, 7, 8, 9]);
    let stats = harness.collector.stats();
    assert_eq!(stats.frames.total_frames, 10);
    assert_eq!(stats.frames.transport_dropped, 0);
    assert_eq!(stats.frames.collector_dropped, 0);
}

#[test]
fn test_superframe_matches_individual() {
    let individual = Arc::new(Recorder::default());
    let mut one = Harness::new(TransmissionMode::Individual, single_stream(9), &[], individual.clone());
    one.feed_individual(0, 18, 0);
    one.wait_for_groups(2);

    let superframe = Arc::new(Recorder::default());
    let mut blocks = Harness::new(TransmissionMode::Superframe, single_stream(9), &[5, 4], superframe.clone());
    for cycle in 0..2u16 {
        let base = cycle * 9;
        let frames: Vec<(u16, u16)> = (0..9).map(|s| (base + s, s)).collect();
        blocks.feed(&frames[..5], 0);
        blocks.feed(&frames[5..], 0);
    }
    blocks.wait_for_groups(2);

    let a = individual.delivered();
    let b = superframe.delivered();
    assert_eq!(a.len(), 2);
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.frame_numbers, y.frame_numbers);
        assert_eq!(x.images, y.images);
    }
}

#[test]
fn test_mixed_mode_streams() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Individual, mixed_mode(), &[], recorder.clone());

    harness.feed_individual(0, 28, 0);
    harness.wait_for_groups(12);

    assert_eq!(recorder.count(StreamId(0xa)), 10);
    assert_eq!(recorder.count(StreamId(0xb)), 2);
    let delivered = recorder.delivered();
    assert_eq!(delivered[0].frame_numbers, vec![0, 1]);
    assert_eq!(delivered[5].stream, StreamId(0xb));
    assert_eq!(delivered[5].frame_numbers, vec![10, 11, 12, 13]);
    assert_eq!(harness.releaser.returned(), harness.fed);
}

#[test]
fn test_reported_exposure_times_follow_reconfig_index() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Individual, single_stream(2), &[], recorder.clone());
    let collector = Arc::clone(&harness.collector);

    collector.set_reported_exposure_times(0, vec![300, 1300]).unwrap();
    collector.set_reported_exposure_times(1, vec![400, 1400]).unwrap();
    assert!(matches!(
        collector.set_reported_exposure_times(0, vec![500, 1500]),
        Err(CollectorError::ExposureOutOfOrder { after: 0, last: 1 })
    ));
    assert!(matches!(
        collector.set_reported_exposure_times(2, vec![500]),
        Err(CollectorError::ExposureCountMismatch { expected: 2, actual: 1 })
    ));
    assert!(collector.pending_reported_exposure_times());
    assert!(!collector.sync_reported_exposure_times(Duration::from_millis(10)));

    for (cycle, reconfig_index) in [0u16, 0, 1, 2].into_iter().enumerate() {
        let base = cycle as u16 * 2;
        harness.feed_individual(base, base + 2, reconfig_index);
    }
    harness.wait_for_groups(4);

    assert!(collector.sync_reported_exposure_times(Duration::from_millis(10)));
    let reported: Vec<Vec<u32>> = recorder.delivered().into_iter().map(|d| d.exposure_times).collect();
    assert_eq!(
        reported,
        vec![vec![200, 1000], vec![200, 1000], vec![300, 1300], vec![400, 1400]]
    );
    assert_eq!(collector.reported_exposure_times(), vec![400, 1400]);
}

#[test]
fn test_consumer_panic_does_not_stop_delivery() {
    let recorder = Arc::new(Recorder::panicking_on(2));
    let mut harness = Harness::new(TransmissionMode::Individual, single_stream(2), &[], recorder.clone());
    let log = Arc::new(EventLog::new());
    harness.collector.set_event_listener(Some(log.clone() as Arc<dyn EventListener>));

    harness.feed_individual(0, 20, 0);
    harness.wait_for_groups(10);

    let delivered = recorder.delivered();
    assert_eq!(delivered.len(), 9);
    assert_eq!(delivered[2].frame_numbers, vec![6, 7]);
    assert_eq!(delivered[8].frame_numbers, vec![18, 19]);

    let stats = harness.collector.stats();
    assert_eq!(stats.groups_delivered, 9);
    assert_eq!(stats.consumer_failures, 1);
    assert_eq!(
        log.count(|e| matches!(e, Event::CaptureStream { severity: Severity::Warning, .. })),
        1
    );
    assert_eq!(harness.releaser.returned(), harness.fed);
}

#[test]
fn test_full_queue_drops_groups() {
    struct Blocking {
        entered: Sender<()>,
        gate: Receiver<()>,
    }

    impl FrameCaptureListener for Blocking {
        fn capture_callback(&self, _data: CallbackData) {
            let _ = self.entered.send(());
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
        }
    }

    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
    let listener = Arc::new(Blocking {
        entered: entered_tx,
        gate: gate_rx,
    });
    let mut harness = Harness::with_config(
        TransmissionMode::Individual,
        single_stream(2),
        &[],
        listener,
        CollectorConfig {
            queue_capacity: 1,
            ..Default::default()
        },
    );

    harness.feed_individual(0, 2, 0);
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // first group is with the consumer, second waits, third has no room
    harness.feed_individual(2, 6, 0);
    assert_eq!(harness.collector.stats().frames.collector_dropped, 2);

    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    harness.wait_for_groups(2);
    assert_eq!(harness.collector.stats().groups_delivered, 2);
}

/// Consumer that acts on the collector from inside its first callback.
struct Reentrant {
    collector: Mutex<Weak<FrameCollector>>,
    replacement: Option<Arc<Recorder>>,
    calls: AtomicUsize,
    released: AtomicUsize,
}

impl Reentrant {
    fn new(harness: &Harness, replacement: Option<Arc<Recorder>>) -> Arc<Self> {
        let listener = Arc::new(Self {
            collector: Mutex::new(Arc::downgrade(&harness.collector)),
            replacement,
            calls: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        });
        harness
            .collector
            .set_listener(Some(listener.clone() as Arc<dyn FrameCaptureListener>));
        listener
    }
}

impl FrameCaptureListener for Reentrant {
    fn capture_callback(&self, data: CallbackData) {
        drop(data);
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return;
        }
        let collector = self.collector.lock().upgrade();
        let Some(collector) = collector else {
            return;
        };
        match &self.replacement {
            Some(next) => collector.set_listener(Some(next.clone() as Arc<dyn FrameCaptureListener>)),
            None => {
                collector.release_all_buffers();
            }
        }
    }

    fn release_all_frames(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_listener_replaced_from_callback() {
    let placeholder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Individual, single_stream(2), &[], placeholder.clone());
    let next = Arc::new(Recorder::default());
    let first = Reentrant::new(&harness, Some(next.clone()));

    harness.feed_individual(0, 2, 0);
    harness.wait_for_groups(1);
    assert_eq!(harness.collector.stats().groups_delivered, 1);

    harness.feed_individual(2, 4, 0);
    harness.wait_for_groups(2);
    assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    let delivered = next.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].frame_numbers, vec![2, 3]);
    assert!(placeholder.delivered().is_empty());
}

#[test]
fn test_release_all_from_callback() {
    let placeholder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Individual, single_stream(2), &[], placeholder);
    let listener = Reentrant::new(&harness, None);

    harness.feed_individual(0, 2, 0);
    harness.wait_for_groups(1);
    assert_eq!(listener.released.load(Ordering::SeqCst), 1);

    // delivery resumes once the release has finished
    harness.feed_individual(2, 6, 0);
    harness.wait_for_groups(3);
    assert_eq!(listener.calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.collector.stats().groups_delivered, 3);
    assert_eq!(harness.releaser.returned(), harness.fed);
}

#[test]
fn test_statistics_event_after_target_rate_cycles() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Individual, single_stream(5), &[], recorder);
    let log = Arc::new(EventLog::new());
    harness.collector.set_event_listener(Some(log.clone() as Arc<dyn EventListener>));

    // 5 frames per cycle at a target rate of 5
    harness.feed_individual(0, 24, 0);
    assert_eq!(log.count(|e| matches!(e, Event::RawFrameStats(_))), 0);
    harness.feed_individual(24, 25, 0);

    let events = log.events();
    assert_eq!(
        events,
        vec![Event::RawFrameStats(RawFrameStats {
            total_frames: 25,
            transport_dropped: 0,
            collector_dropped: 0,
        })]
    );
    assert_eq!(harness.collector.flush_raw_frame_statistics(false), RawFrameStats::default());
}

#[test]
fn test_event_listener_may_query_collector() {
    #[derive(Default)]
    struct Querying {
        collector: Mutex<Weak<FrameCollector>>,
        totals: Mutex<Vec<u64>>,
    }

    impl EventListener for Querying {
        fn on_event(&self, event: Event) {
            if !matches!(event, Event::RawFrameStats(_)) {
                return;
            }
            let collector = self.collector.lock().upgrade();
            if let Some(collector) = collector {
                let total = collector.stats().frames.total_frames;
                collector.flush_raw_frame_statistics(false);
                self.totals.lock().push(total);
            }
        }
    }

    let recorder = Arc::new(Recorder::default());
    let mut harness = Harness::new(TransmissionMode::Individual, single_stream(5), &[], recorder);
    let querying = Arc::new(Querying::default());
    *querying.collector.lock() = Arc::downgrade(&harness.collector);
    harness.collector.set_event_listener(Some(querying.clone() as Arc<dyn EventListener>));

    let collector = Arc::clone(&harness.collector);
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let feeder = thread::spawn(move || {
        harness.feed_individual(0, 25, 0);
        let _ = done_tx.send(());
        harness
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    let _harness = feeder.join().unwrap();

    assert_eq!(*querying.totals.lock(), vec![25]);
    assert_eq!(collector.stats().frames.total_frames, 25);
}

#[test]
#[traced_test]
fn test_buffer_before_configuration() {
    let releaser = Arc::new(CountingReleaser::default());
    let collector = FrameCollector::new(TransmissionMode::Individual, releaser.clone(), CollectorConfig::default()).unwrap();

    let result = collector.buffer_callback(CapturedBuffer::new(64));
    assert!(matches!(result, Err(CollectorError::NotConfigured)));
    assert_eq!(releaser.returned(), 1);
    assert!(logs_contain("Buffer received before configuration"));
}

#[test]
fn test_buffer_after_shutdown() {
    let recorder = Arc::new(Recorder::default());
    let harness = Harness::new(TransmissionMode::Individual, single_stream(2), &[], recorder.clone());
    harness.collector.shutdown();

    let buffer = harness.buffer(&[(0, 0)], 0);
    assert!(matches!(
        harness.collector.buffer_callback(buffer),
        Err(CollectorError::Stopped)
    ));
    assert_eq!(harness.releaser.returned(), 1);
    assert!(matches!(
        harness
            .collector
            .execute_configuration(&AcceptAll, single_stream(2), &[]),
        Err(CollectorError::Stopped)
    ));
}

#[test]
fn test_intake_does_not_wait_for_configuration_change() {
    struct Gated {
        entered: Sender<()>,
        proceed: Receiver<()>,
    }

    impl BridgeDataReceiver for Gated {
        fn execute_configuration(&self, _width: u16, _height: u16, buffer_count: usize) -> Result<usize, TransportError> {
            let _ = self.entered.send(());
            let _ = self.proceed.recv_timeout(Duration::from_secs(5));
            Ok(buffer_count)
        }
    }

    let recorder = Arc::new(Recorder::default());
    let harness = Harness::new(TransmissionMode::Individual, single_stream(1), &[], recorder.clone());
    let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
    let (proceed_tx, proceed_rx) = crossbeam_channel::bounded(1);

    let collector = Arc::clone(&harness.collector);
    let reconfigure = thread::spawn(move || {
        let gated = Gated {
            entered: entered_tx,
            proceed: proceed_rx,
        };
        collector.execute_configuration(&gated, single_stream(1), &[])
    });
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let started = Instant::now();
    let buffer = harness.buffer(&[(0, 0)], 0);
    harness.collector.buffer_callback(buffer).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(harness.releaser.returned(), 1);

    proceed_tx.send(()).unwrap();
    assert!(reconfigure.join().unwrap().is_ok());
    assert!(recorder.delivered().is_empty());
}

#[test]
fn test_buffer_too_small_is_rejected() {
    let recorder = Arc::new(Recorder::default());
    let harness = Harness::new(TransmissionMode::Individual, single_stream(2), &[], recorder);
    let result = harness.collector.buffer_callback(CapturedBuffer::new(8));
    assert!(matches!(result, Err(CollectorError::BufferTooSmall { .. })));
    assert_eq!(harness.releaser.returned(), 1);
}
