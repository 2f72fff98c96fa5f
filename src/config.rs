//! Session configuration file.
//!
//! Everything a capture session needs, in one TOML file:
//!
//! ```toml
//! [reassembler.framing]
//! kind = "marker"
//! padding_size = 1024
//!
//! [collector]
//! mode = "superframe"
//! block_sizes = [5, 4]
//!
//! [usecase]
//! image_width = 224
//! image_height = 172
//! raw_frame_count = 9
//!
//! [output]
//! cycles = 20
//! ```

use crate::collector::{calculate_actions, collector_frame_groups, CollectorConfig, TransmissionMode};
use crate::transport::ReassemblerConfig;
use crate::usecase::CaptureConfiguration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration loading and validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Collector section: transmission mode plus the collector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CollectorSection {
    /// How the transport packs raw frames into buffers.
    pub mode: TransmissionMode,
    /// Raw frames per buffer in superframe mode, in capture order.
    pub block_sizes: Vec<u16>,
    /// Queue and timeout settings.
    #[serde(flatten)]
    pub settings: CollectorConfig,
}

/// What the demo binary does with the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Capture pattern repetitions to run (0 runs until interrupted).
    pub cycles: u32,
    /// Print the Prometheus text exposition when done.
    pub print_metrics: bool,
    /// Metrics server port (0 to disable); needs the `metrics` feature.
    pub metrics_port: u16,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            cycles: 10,
            print_metrics: false,
            metrics_port: 0,
        }
    }
}

/// Full configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    /// Transport framing and acquisition settings.
    #[serde(default)]
    pub reassembler: ReassemblerConfig,
    /// Frame collector settings.
    #[serde(default)]
    pub collector: CollectorSection,
    /// Capture configuration to execute.
    #[serde(default)]
    pub usecase: CaptureConfiguration,
    /// Demo output settings.
    #[serde(default)]
    pub output: OutputConfig,
}

impl SessionConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        let config: SessionConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration can be executed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.usecase
            .verify()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.collector.settings.queue_capacity == 0 {
            return Err(ConfigError::Invalid("collector queue capacity must be non-zero".into()));
        }
        let groups = collector_frame_groups(&self.usecase);
        calculate_actions(self.collector.mode, &self.usecase, &groups, &self.block_sizes())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    /// Superframe block sizes, defaulting to the whole pattern in one
    /// buffer.
    pub fn block_sizes(&self) -> Vec<u16> {
        if self.collector.block_sizes.is_empty() {
            vec![self.usecase.raw_frame_count]
        } else {
            self.collector.block_sizes.clone()
        }
    }
}
