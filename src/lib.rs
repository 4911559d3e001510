//! Zero-copy camera capture core
//!
//! A [`capture::DeviceSession`] owns one camera, a fixed pool of hardware
//! buffers and one reusable request per buffer. Completed requests are
//! mapped, handed to a [`sink::FrameSink`], unmapped and resubmitted from the
//! device's completion thread, so the number of buffers in circulation stays
//! constant for the whole run.

pub mod capture;
pub mod config;
pub mod error;
pub mod sink;
pub mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use capture::frame::PixelFormat;
use capture::stream::{FrameControls, StreamRequest, StreamRole};
use capture::{CameraManager, V4l2CameraManager, VirtualCameraManager, VirtualSpec};

pub use error::{CaptureError, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cameras: Vec<CameraConfig>,
    pub pipeline: PipelineConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    V4l2,
    Virtual,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device identifier; empty means auto-detect
    pub id: String,
    pub backend: Backend,
    pub role: StreamRole,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<PixelFormat>,
    pub buffer_count: Option<u32>,
    pub controls: FrameControls,
}

impl CameraConfig {
    /// Identifier to open for camera `index`; `None` when a hardware camera
    /// has to be auto-detected.
    pub fn device_id(&self, index: usize) -> Option<String> {
        match (self.id.is_empty(), self.backend) {
            (false, _) => Some(self.id.clone()),
            (true, Backend::Virtual) => Some(format!("virtual{}", index)),
            (true, Backend::V4l2) => None,
        }
    }

    pub fn stream_request(&self) -> StreamRequest {
        StreamRequest {
            format: self.format,
            width: self.width,
            height: self.height,
            buffer_count: self.buffer_count,
            frame_duration_limits: self.controls.frame_duration_limits,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stop after this many seconds; 0 runs until interrupted
    pub run_for_secs: u64,
    pub stats_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            run_for_secs: 0,
            stats_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Log,
    Raw,
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub output_dir: PathBuf,
    /// Log one frame out of this many
    pub log_every: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Log,
            output_dir: PathBuf::from("captures"),
            log_every: 30,
        }
    }
}

/// Build the camera manager for `backend`.
///
/// Virtual cameras are created for the virtual entries of `cameras`, so
/// sessions open them exactly like hardware nodes.
pub fn camera_manager(backend: Backend, cameras: &[CameraConfig]) -> Arc<dyn CameraManager> {
    match backend {
        Backend::V4l2 => Arc::new(V4l2CameraManager::new()),
        Backend::Virtual => {
            let specs = cameras
                .iter()
                .enumerate()
                .filter(|(_, c)| c.backend == Backend::Virtual)
                .filter_map(|(i, c)| c.device_id(i))
                .map(VirtualSpec::new)
                .collect();
            Arc::new(VirtualCameraManager::new(specs))
        }
    }
}

/// Snapshot of one session's counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub map_failures: u64,
    pub sink_failures: u64,
    pub requests_retired: u64,
    pub requeue_failures: u64,
    pub sequence_gaps: u64,
    pub mappings_opened: u64,
    /// Mappings opened and not yet released
    pub mappings_open: u64,
}
