//! Stream negotiation types and per-request controls

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::frame::PixelFormat;

/// Intended use of a stream; the device picks its default configuration from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    #[default]
    Viewfinder,
    VideoRecording,
    StillCapture,
    Raw,
}

/// Device-assigned handle of a configured stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

/// Bounds on the time between two frames, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDurationLimits {
    pub min_us: u64,
    pub max_us: u64,
}

impl FrameDurationLimits {
    pub fn new(min_us: u64, max_us: u64) -> Self {
        Self {
            min_us: min_us.min(max_us),
            max_us: max_us.max(min_us),
        }
    }

    pub fn min(&self) -> Duration {
        Duration::from_micros(self.min_us)
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_us)
    }
}

/// Negotiated stream configuration.
///
/// Whatever the caller asked for, only the copy returned by device validation
/// describes what the hardware will actually produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfiguration {
    pub role: StreamRole,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub frame_duration_limits: Option<FrameDurationLimits>,
}

impl StreamConfiguration {
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl fmt::Display for StreamConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}-{} ({} buffers",
            self.width, self.height, self.format, self.buffer_count
        )?;
        if let Some(limits) = self.frame_duration_limits {
            write!(f, ", {}..{}us", limits.min_us, limits.max_us)?;
        }
        write!(f, ")")
    }
}

/// Caller overrides applied to the device default before validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamRequest {
    pub format: Option<PixelFormat>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub buffer_count: Option<u32>,
    pub frame_duration_limits: Option<FrameDurationLimits>,
}

impl StreamRequest {
    pub fn size(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    pub fn apply(&self, cfg: &mut StreamConfiguration) {
        if let Some(format) = self.format {
            cfg.format = format;
        }
        if let Some(width) = self.width {
            cfg.width = width;
        }
        if let Some(height) = self.height {
            cfg.height = height;
        }
        if let Some(count) = self.buffer_count {
            cfg.buffer_count = count;
        }
        if self.frame_duration_limits.is_some() {
            cfg.frame_duration_limits = self.frame_duration_limits;
        }
    }
}

/// Outcome of device-side validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Valid,
    /// Some values were clamped to what the device supports
    Adjusted,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusMode {
    Manual,
    Auto,
    Continuous,
}

/// Recognised per-request controls, applied to every submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameControls {
    #[serde(default)]
    pub focus_mode: Option<FocusMode>,
    #[serde(default)]
    pub frame_duration_limits: Option<FrameDurationLimits>,
}

impl FrameControls {
    pub fn is_empty(&self) -> bool {
        self.focus_mode.is_none() && self.frame_duration_limits.is_none()
    }
}
