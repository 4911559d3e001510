//! Error taxonomy for the capture core

use std::io;

use thiserror::Error;

/// Result type alias using CaptureError
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Errors raised by device sessions, buffer allocation and frame handoff.
///
/// Setup errors (`open`, `configure`, `start`) are fatal to the session and
/// surfaced to the caller. `MapFailed` and `SinkDeliveryFailed` only ever
/// describe a single frame; the completion handler logs them and keeps the
/// pipeline running.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Camera identifier did not resolve
    #[error("camera not found: {0}")]
    NotFound(String),

    /// Camera is held by another owner
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),

    /// Validation could not produce any acceptable stream configuration
    #[error("stream configuration rejected: {0}")]
    ConfigurationRejected(String),

    /// Device could not reserve buffers for the stream
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    #[error("request creation failed for slot {slot}: {reason}")]
    RequestCreationFailed { slot: usize, reason: String },

    /// Mapping a plane into the address space failed
    #[error("failed to map plane {plane} of buffer {buffer}: {source}")]
    MapFailed {
        buffer: usize,
        plane: usize,
        #[source]
        source: nix::Error,
    },

    #[error("sink delivery failed: {0}")]
    SinkDeliveryFailed(String),

    /// Device refused a request submission
    #[error("failed to queue request {slot}: {reason}")]
    QueueFailed { slot: usize, reason: String },

    /// Operation called in a session state that does not allow it
    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl CaptureError {
    /// Setup stage an error belongs to, used for diagnostics on fatal exits.
    pub fn stage(&self) -> &'static str {
        match self {
            CaptureError::NotFound(_) | CaptureError::DeviceUnavailable(_) => "open",
            CaptureError::ConfigurationRejected(_) | CaptureError::Config(_) => "configure",
            CaptureError::AllocationFailed(_)
            | CaptureError::RequestCreationFailed { .. }
            | CaptureError::QueueFailed { .. } => "start",
            CaptureError::MapFailed { .. } | CaptureError::SinkDeliveryFailed(_) => "frame",
            CaptureError::InvalidState(_) | CaptureError::Io(_) => "device",
        }
    }

    /// Whether the error only concerns one frame and must not stop the session.
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            CaptureError::MapFailed { .. } | CaptureError::SinkDeliveryFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_errors_name_their_stage() {
        assert_eq!(CaptureError::NotFound("cam0".into()).stage(), "open");
        assert_eq!(
            CaptureError::ConfigurationRejected("no format".into()).stage(),
            "configure"
        );
        assert_eq!(
            CaptureError::AllocationFailed("oom".into()).stage(),
            "start"
        );
    }

    #[test]
    fn frame_errors_are_not_fatal() {
        let err = CaptureError::MapFailed {
            buffer: 1,
            plane: 0,
            source: nix::Error::ENOMEM,
        };
        assert!(err.is_per_frame());
        assert!(CaptureError::SinkDeliveryFailed("disk full".into()).is_per_frame());
        assert!(!CaptureError::DeviceUnavailable("busy".into()).is_per_frame());
    }
}
