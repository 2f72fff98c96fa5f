//! ToF Capture CLI
//!
//! Runs a capture session against the synthetic camera and reports what
//! arrived: delivered frame groups, drops and transport statistics.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tof_capture::{
    buffer::BufferDataFormat,
    collector::{CallbackData, FrameCaptureListener, TransmissionMode},
    config::SessionConfig,
    events::{Event, EventListener, Severity},
    metrics::MetricsRegistry,
    session::CaptureSession,
    transport::{synthetic::SyntheticCamera, FramingConfig, HeaderFramingConfig, MarkerFramingConfig},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FramingArg {
    Header,
    Marker,
}

/// Capture frame groups from a synthetic ToF camera.
#[derive(Debug, Parser)]
#[command(name = "tof-capture", version, about)]
struct Args {
    /// Session configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture pattern repetitions to run; 0 runs until interrupted.
    #[arg(long)]
    cycles: Option<u32>,

    /// Transport framing of the synthetic camera.
    #[arg(long, value_enum)]
    framing: Option<FramingArg>,

    /// Lose every n-th transport buffer.
    #[arg(long)]
    drop_every: Option<u64>,

    /// Pack several raw frames per buffer.
    #[arg(long)]
    superframe: bool,
}

/// Counts delivered groups.
#[derive(Default)]
struct GroupCounter {
    groups: AtomicU64,
    frames: AtomicU64,
}

impl FrameCaptureListener for GroupCounter {
    fn capture_callback(&self, data: CallbackData) {
        self.groups.fetch_add(1, Ordering::Relaxed);
        self.frames.fetch_add(data.frames.len() as u64, Ordering::Relaxed);
        debug!(
            stream = %data.stream_id,
            frames = data.frames.len(),
            timestamp_us = data.metadata.timestamp_us,
            temperature = ?data.metadata.temperature,
            "Frame group"
        );
    }
}

/// Writes capture events to the log.
struct LogEvents;

impl EventListener for LogEvents {
    fn on_event(&self, event: Event) {
        match &event {
            Event::CaptureStream {
                severity: Severity::Error,
                ..
            }
            | Event::DeviceDisconnected => warn!(%event, "Capture event"),
            _ => info!(%event, "Capture event"),
        }
    }
}

fn load_config(args: &Args) -> SessionConfig {
    let mut config = match &args.config {
        Some(path) => match SessionConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => SessionConfig::default(),
    };

    if let Some(cycles) = args.cycles {
        config.output.cycles = cycles;
    }
    let marker = matches!(config.reassembler.framing, FramingConfig::Marker(_));
    match (args.framing, marker) {
        (Some(FramingArg::Header), true) => {
            config.reassembler.framing = FramingConfig::Header(HeaderFramingConfig::default());
        }
        (Some(FramingArg::Marker), false) => {
            config.reassembler.framing = FramingConfig::Marker(MarkerFramingConfig::default());
        }
        _ => {}
    }
    if args.superframe {
        config.collector.mode = TransmissionMode::Superframe;
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }
    config
}

fn build_camera(config: &SessionConfig, drop_every: Option<u64>) -> SyntheticCamera {
    let usecase = &config.usecase;
    let superframe = config.collector.mode == TransmissionMode::Superframe;
    let blocks = config.block_sizes();
    let buffers_per_cycle = if superframe {
        blocks.iter().filter(|&&b| b != 0).count().max(1) as u64
    } else {
        u64::from(usecase.raw_frame_count)
    };

    let mut camera = match &config.reassembler.framing {
        FramingConfig::Header(header) => SyntheticCamera::header_framed(header, BufferDataFormat::Raw12),
        FramingConfig::Marker(marker) => SyntheticCamera::marker_framed(marker),
    }
    .with_configuration(usecase);

    let per_second = buffers_per_cycle * u64::from(usecase.target_rate);
    camera = camera.with_interval(Duration::from_micros(1_000_000 / per_second.max(1)));
    if superframe {
        camera = camera.with_blocks(blocks);
    }

    let limit = match config.output.cycles {
        0 => None,
        cycles => Some(u64::from(cycles) * buffers_per_cycle),
    };
    if let Some(n) = drop_every.filter(|&n| n > 0) {
        // unbounded runs only get drops within a fixed horizon
        let horizon = limit.unwrap_or(1 << 20);
        camera = camera.with_dropped_buffers((1..=horizon / n).map(|k| k * n - 1));
    }
    if let Some(limit) = limit {
        camera = camera.with_limit(limit).disconnect_when_done();
    }
    camera
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("ToF Capture v{}", tof_capture::VERSION);

    let args = Args::parse();
    let config = load_config(&args);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        if let Err(e) = ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)) {
            warn!("Failed to install Ctrl-C handler: {}", e);
        }
    }

    let session = match CaptureSession::from_config(&config) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Failed to create capture session: {}", e);
            std::process::exit(1);
        }
    };
    let counter = Arc::new(GroupCounter::default());
    session.set_listener(Some(counter.clone() as Arc<dyn FrameCaptureListener>));
    session.set_event_listener(Some(Arc::new(LogEvents)));

    let camera = build_camera(&config, args.drop_every);
    let started = session
        .open(Box::new(camera))
        .and_then(|()| session.execute_configuration(config.usecase.clone(), &config.block_sizes()))
        .and_then(|executed| {
            info!(
                width = executed.buffer_width,
                height = executed.buffer_height,
                buffers = executed.allocated,
                "Configuration executed"
            );
            session.start()
        });
    if let Err(e) = started {
        error!("Failed to start capture: {}", e);
        std::process::exit(1);
    }

    let registry = match MetricsRegistry::new() {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Failed to create metrics registry: {}", e);
            std::process::exit(1);
        }
    };

    #[cfg(feature = "metrics")]
    let (_runtime, server_state) = start_metrics_server(config.output.metrics_port);
    #[cfg(not(feature = "metrics"))]
    if config.output.metrics_port != 0 {
        warn!("Metrics server requested but the `metrics` feature is disabled");
    }

    info!(cycles = config.output.cycles, "Capturing...");
    let start = Instant::now();
    while running.load(Ordering::SeqCst) && session.is_acquiring() {
        thread::sleep(Duration::from_millis(100));
        let snapshot = session.metrics_snapshot();
        registry.update(&snapshot);
        #[cfg(feature = "metrics")]
        if let Some(state) = &server_state {
            state.blocking_write().update(&snapshot);
        }
    }

    // let the conveyance thread hand out what is already queued
    let deadline = Instant::now() + Duration::from_secs(2);
    while session.collector().stats().queued_groups > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let elapsed = start.elapsed();
    let snapshot = session.metrics_snapshot();
    registry.update(&snapshot);
    session.close();

    info!(
        "Delivered {} groups ({} frames) in {:.2}s",
        counter.groups.load(Ordering::Relaxed),
        counter.frames.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
    info!(
        "Raw frames: {} total, {} lost in transport, {} dropped by collector",
        snapshot.raw_frames, snapshot.bridge_dropped, snapshot.collector_dropped
    );
    info!(
        "Transport: {} payloads, {} corrupt images, {} realignments, {} starvations",
        snapshot.payloads, snapshot.corrupt_frames, snapshot.realignments, snapshot.buffer_starvations
    );

    if config.output.print_metrics {
        match registry.encode() {
            Ok(text) => println!("{}", text),
            Err(e) => warn!("Failed to encode metrics: {}", e),
        }
    }

    info!("Done.");
}

#[cfg(feature = "metrics")]
fn start_metrics_server(
    port: u16,
) -> (
    Option<tokio::runtime::Runtime>,
    Option<Arc<tokio::sync::RwLock<tof_capture::metrics::MetricsState>>>,
) {
    use tof_capture::metrics::{MetricsServer, MetricsServerConfig};

    if port == 0 {
        return (None, None);
    }
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!("Failed to start metrics runtime: {}", e);
            return (None, None);
        }
    };
    let registry = match MetricsRegistry::new() {
        Ok(registry) => registry,
        Err(e) => {
            warn!("Failed to create server registry: {}", e);
            return (None, None);
        }
    };
    let server = MetricsServer::new(MetricsServerConfig::with_port(port), registry);
    let state = server.state();
    runtime.spawn(async move {
        if let Err(e) = server.run().await {
            error!("Metrics server failed: {}", e);
        }
    });
    (Some(runtime), Some(state))
}
