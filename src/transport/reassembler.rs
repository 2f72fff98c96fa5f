//! The acquisition thread and the buffer pool behind it.

use super::header::{Assembly, HeaderFramedAssembler, HeaderFramingConfig};
use super::marker::{MarkerFramedAssembler, MarkerFramingConfig};
use super::{BridgeDataReceiver, BufferCaptureListener, PayloadSource, TransportError};
use crate::buffer::{BufferPool, BufferReleaser, CapturedBuffer};
use crate::events::{Event, EventForwarder, EventListener, Severity};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Which framing the transport uses, with its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FramingConfig {
    /// Payloads with a small header each.
    Header(HeaderFramingConfig),
    /// A pixel stream with in-frame marker bits.
    Marker(MarkerFramingConfig),
}

impl Default for FramingConfig {
    fn default() -> Self {
        FramingConfig::Header(HeaderFramingConfig::default())
    }
}

/// A configured assembler for one of the framings.
#[derive(Debug)]
pub enum Framing {
    /// Header-framed payloads.
    Header(HeaderFramedAssembler),
    /// Marker-framed reads.
    Marker(MarkerFramedAssembler),
}

impl Framing {
    /// Builds the assembler `config` describes for images of
    /// `pixel_count` pixels.
    pub fn new(config: &FramingConfig, pixel_count: usize) -> Result<Self, TransportError> {
        Ok(match config {
            FramingConfig::Header(c) => Framing::Header(HeaderFramedAssembler::new(c.clone(), pixel_count)?),
            FramingConfig::Marker(c) => Framing::Marker(MarkerFramedAssembler::new(c.clone(), pixel_count)?),
        })
    }

    /// Processes one transport unit.
    pub fn poll(
        &mut self,
        source: &mut dyn PayloadSource,
        buffer: &mut CapturedBuffer,
    ) -> Result<Assembly, TransportError> {
        match self {
            Framing::Header(assembler) => assembler.poll(source, buffer),
            Framing::Marker(assembler) => assembler.poll(source, buffer),
        }
    }

    /// Transport units processed so far.
    pub fn payloads(&self) -> u64 {
        match self {
            Framing::Header(assembler) => assembler.payloads(),
            Framing::Marker(assembler) => assembler.images() + assembler.discarded(),
        }
    }

    /// Successful stream realignments so far.
    pub fn realignments(&self) -> u64 {
        match self {
            Framing::Header(_) => 0,
            Framing::Marker(assembler) => assembler.realignments(),
        }
    }

    fn reset(&mut self, source: &mut dyn PayloadSource) {
        match self {
            Framing::Header(assembler) => assembler.reset(source),
            Framing::Marker(_) => source.cancel_pending(),
        }
    }
}

/// Reassembler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblerConfig {
    /// Framing of the transport.
    pub framing: FramingConfig,
    /// How long to wait for a free buffer before reporting starvation.
    pub dequeue_timeout_ms: u64,
    /// Pause after a starvation report before trying again.
    pub no_buffer_backoff_ms: u64,
    /// Upper bound on waiting for buffers to return on reconfiguration.
    pub dealloc_timeout_ms: u64,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            framing: FramingConfig::default(),
            dequeue_timeout_ms: 100,
            no_buffer_backoff_ms: 100,
            dealloc_timeout_ms: 2000,
        }
    }
}

/// Counters of the acquisition thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    /// Transport units processed by the current or last capture.
    pub payloads: u64,
    /// Stream realignments of the current or last capture.
    pub realignments: u64,
    /// Complete images handed to the listener.
    pub images: u64,
    /// Images thrown away during reassembly.
    pub discarded: u64,
    /// Times the thread found no free buffer.
    pub starvations: u64,
    /// Complete images returned to the pool because nobody wanted them.
    pub unclaimed: u64,
}

#[derive(Default)]
struct Shared {
    running: AtomicBool,
    connected: AtomicBool,
    listener: RwLock<Option<Arc<dyn BufferCaptureListener>>>,
    events: EventForwarder,
    payloads: AtomicU64,
    realignments: AtomicU64,
    images: AtomicU64,
    discarded: AtomicU64,
    starvations: AtomicU64,
    unclaimed: AtomicU64,
}

/// Runs the acquisition thread of one transport connection.
///
/// Buffers come from an internal [`BufferPool`] sized by
/// [`BridgeDataReceiver::execute_configuration`]; completed buffers go to
/// the [`BufferCaptureListener`], which returns them through
/// [`Reassembler::pool`].
pub struct Reassembler {
    config: ReassemblerConfig,
    pool: Arc<BufferPool>,
    shared: Arc<Shared>,
    source: Mutex<Option<Box<dyn PayloadSource>>>,
    thread: Mutex<Option<JoinHandle<Box<dyn PayloadSource>>>>,
}

impl Reassembler {
    /// Creates a reassembler without a connection.
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config,
            pool: Arc::new(BufferPool::new()),
            shared: Arc::new(Shared::default()),
            source: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    /// The pool buffers are taken from and must be returned to.
    pub fn pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.pool)
    }

    /// Takes over a connected payload source.
    pub fn open_connection(&self, source: Box<dyn PayloadSource>) -> Result<(), TransportError> {
        if self.is_acquiring() {
            return Err(TransportError::CaptureRunning);
        }
        *self.source.lock() = Some(source);
        self.shared.connected.store(true, Ordering::Release);
        tracing::info!("Transport connection opened");
        Ok(())
    }

    /// Stops capturing and gives the payload source back.
    pub fn close_connection(&self) -> Option<Box<dyn PayloadSource>> {
        if let Err(e) = self.stop_capture() {
            tracing::warn!(error = %e, "Stopping capture on close failed");
        }
        self.shared.connected.store(false, Ordering::Release);
        let source = self.source.lock().take();
        if source.is_some() {
            tracing::info!("Transport connection closed");
        }
        source
    }

    /// True while a payload source is attached and has not disconnected.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// True while the acquisition thread runs.
    pub fn is_acquiring(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Replaces the receiver of completed buffers.
    pub fn set_listener(&self, listener: Option<Arc<dyn BufferCaptureListener>>) {
        *self.shared.listener.write() = listener;
    }

    /// Replaces the event listener.
    pub fn set_event_listener(&self, listener: Option<Arc<dyn EventListener>>) {
        self.shared.events.set_listener(listener);
    }

    /// Starts the acquisition thread.
    pub fn start_capture(&self) -> Result<(), TransportError> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            if self.is_acquiring() {
                return Err(TransportError::CaptureRunning);
            }
            // the previous thread stopped on its own; reclaim its source
            self.join(&mut thread);
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let pixel_count = self.pool.pixel_count();
        if self.pool.capacity() == 0 || pixel_count == 0 {
            return Err(TransportError::InvalidSize("no capture buffers allocated".into()));
        }
        let framing = Framing::new(&self.config.framing, pixel_count)?;
        let source = self.source.lock().take().ok_or(TransportError::NotConnected)?;

        self.pool.resume();
        self.shared.running.store(true, Ordering::Release);
        let acquisition = Acquisition {
            shared: Arc::clone(&self.shared),
            pool: Arc::clone(&self.pool),
            framing,
            dequeue_timeout: Duration::from_millis(self.config.dequeue_timeout_ms),
            backoff: Duration::from_millis(self.config.no_buffer_backoff_ms),
        };
        let handle = thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || acquisition.run(source));
        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                tracing::info!(pixel_count, "Capture started");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.connected.store(false, Ordering::Release);
                Err(TransportError::Thread(e))
            }
        }
    }

    /// Stops the acquisition thread and waits for it to exit.
    pub fn stop_capture(&self) -> Result<(), TransportError> {
        let mut thread = self.thread.lock();
        if thread.is_none() {
            return Ok(());
        }
        self.shared.running.store(false, Ordering::Release);
        self.pool.unblock();
        self.join(&mut thread);
        tracing::info!("Capture stopped");
        Ok(())
    }

    fn join(&self, thread: &mut Option<JoinHandle<Box<dyn PayloadSource>>>) {
        let Some(handle) = thread.take() else {
            return;
        };
        match handle.join() {
            Ok(source) => *self.source.lock() = Some(source),
            Err(_) => {
                tracing::error!("Acquisition thread panicked");
                self.shared.connected.store(false, Ordering::Release);
            }
        }
    }

    /// Counters since creation.
    pub fn stats(&self) -> ReassemblerStats {
        ReassemblerStats {
            payloads: self.shared.payloads.load(Ordering::Relaxed),
            realignments: self.shared.realignments.load(Ordering::Relaxed),
            images: self.shared.images.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
            starvations: self.shared.starvations.load(Ordering::Relaxed),
            unclaimed: self.shared.unclaimed.load(Ordering::Relaxed),
        }
    }
}

impl BridgeDataReceiver for Reassembler {
    fn execute_configuration(
        &self,
        width: u16,
        height: u16,
        buffer_count: usize,
    ) -> Result<usize, TransportError> {
        if self.is_acquiring() {
            return Err(TransportError::CaptureRunning);
        }
        let listener = self.shared.listener.read().clone();
        if let Some(listener) = listener {
            listener.release_all_buffers();
        }
        self.pool
            .wait_dealloc(Duration::from_millis(self.config.dealloc_timeout_ms))?;
        let pixel_count = width as usize * height as usize;
        let allocated = self.pool.allocate(buffer_count, pixel_count)?;
        tracing::debug!(width, height, allocated, "Transport buffers allocated");
        Ok(allocated)
    }
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        if let Err(e) = self.stop_capture() {
            tracing::warn!(error = %e, "Stopping capture on drop failed");
        }
    }
}

impl std::fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reassembler")
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .field("acquiring", &self.is_acquiring())
            .finish_non_exhaustive()
    }
}

struct Acquisition {
    shared: Arc<Shared>,
    pool: Arc<BufferPool>,
    framing: Framing,
    dequeue_timeout: Duration,
    backoff: Duration,
}

impl Acquisition {
    fn run(mut self, mut source: Box<dyn PayloadSource>) -> Box<dyn PayloadSource> {
        tracing::debug!("Acquisition thread started");
        let mut in_flight: Option<CapturedBuffer> = None;
        let mut starving = false;

        while self.shared.running.load(Ordering::Acquire) {
            let mut buffer = match in_flight.take() {
                Some(buffer) => buffer,
                None => match self.pool.dequeue(self.dequeue_timeout) {
                    Some(buffer) => {
                        starving = false;
                        buffer
                    }
                    None => {
                        if self.shared.running.load(Ordering::Acquire)
                            && !self.pool.is_change_in_progress()
                        {
                            if !starving {
                                tracing::warn!("No free capture buffer");
                                self.shared.starvations.fetch_add(1, Ordering::Relaxed);
                                self.shared.events.emit(Event::BufferStarvation);
                                starving = true;
                            }
                            thread::sleep(self.backoff);
                        }
                        continue;
                    }
                },
            };

            let result = self.framing.poll(source.as_mut(), &mut buffer);
            self.shared
                .payloads
                .store(self.framing.payloads(), Ordering::Relaxed);
            self.shared
                .realignments
                .store(self.framing.realignments(), Ordering::Relaxed);
            match result {
                Ok(Assembly::Complete) => {
                    buffer.set_timestamp_us(chrono::Utc::now().timestamp_micros().max(0) as u64);
                    self.deliver(buffer);
                }
                Ok(Assembly::Discarded) => {
                    self.shared.discarded.fetch_add(1, Ordering::Relaxed);
                    in_flight = Some(buffer);
                }
                Ok(Assembly::Pending) => in_flight = Some(buffer),
                Err(TransportError::Disconnected) => {
                    tracing::error!("Device disconnected");
                    self.shared.connected.store(false, Ordering::Release);
                    self.shared.events.emit(Event::DeviceDisconnected);
                    in_flight = Some(buffer);
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Acquisition failed, no more frames will be captured");
                    self.shared.events.capture_stream(Severity::Error, e.to_string());
                    in_flight = Some(buffer);
                    break;
                }
            }
        }

        self.shared.running.store(false, Ordering::Release);
        self.framing.reset(source.as_mut());
        if let Some(buffer) = in_flight {
            self.pool.release_buffer(buffer);
        }
        tracing::debug!("Acquisition thread stopped");
        source
    }

    fn deliver(&self, buffer: CapturedBuffer) {
        let listener = self.shared.listener.read().clone();
        match listener {
            Some(listener) if !self.pool.is_change_in_progress() => {
                self.shared.images.fetch_add(1, Ordering::Relaxed);
                listener.buffer_callback(buffer);
            }
            _ => {
                self.shared.unclaimed.fetch_add(1, Ordering::Relaxed);
                self.pool.release_buffer(buffer);
            }
        }
    }
}
