//! Narrow interface to the camera subsystem
//!
//! The core never talks to a driver directly. A [`CameraManager`] resolves and
//! acquires devices; the acquired [`CameraDevice`] negotiates a stream,
//! reserves buffers, accepts request submissions and reports completions on a
//! thread it owns.

use std::fmt;
use std::sync::Arc;

use crate::capture::buffer::FrameBuffer;
use crate::capture::frame::FrameMetadata;
use crate::capture::stream::{
    FrameControls, StreamConfiguration, StreamId, StreamRole, ValidationStatus,
};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    /// The device was stopped before the request produced a frame
    Cancelled,
}

/// A finished request as reported by the device.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub slot: usize,
    pub status: RequestStatus,
    pub metadata: FrameMetadata,
}

impl Completion {
    pub fn success(slot: usize, metadata: FrameMetadata) -> Self {
        Self {
            slot,
            status: RequestStatus::Success,
            metadata,
        }
    }

    pub fn cancelled(slot: usize) -> Self {
        Self {
            slot,
            status: RequestStatus::Cancelled,
            metadata: FrameMetadata::default(),
        }
    }
}

/// Callback registered once per session, invoked once per completed request.
pub type CompletionHandler = Arc<dyn Fn(Completion) + Send + Sync>;

/// Device enumeration and acquisition.
pub trait CameraManager: Send + Sync {
    fn list_devices(&self) -> Vec<String>;

    /// Exclusively acquire the named device.
    ///
    /// Fails with `NotFound` if `id` does not resolve and `DeviceUnavailable`
    /// if the device is already held.
    fn acquire(&self, id: &str) -> Result<Arc<dyn CameraDevice>>;
}

/// An acquired camera.
///
/// Requests are identified by slot index; slot `i` is permanently bound to
/// buffer `i` of the allocated pool.
///
/// Implementations must invoke the completion handler without holding any
/// lock that [`CameraDevice::queue`] takes, since the handler resubmits from
/// inside the callback.
pub trait CameraDevice: Send + Sync {
    fn id(&self) -> &str;

    fn generate_configuration(&self, role: StreamRole) -> Result<StreamConfiguration>;

    /// Adjust `config` in place to something the device supports.
    fn validate(&self, config: &mut StreamConfiguration) -> ValidationStatus;

    /// Apply a validated configuration.
    fn configure(&self, config: &StreamConfiguration) -> Result<StreamId>;

    /// Reserve the stream's buffers. Called once per session.
    fn allocate(&self, stream: StreamId) -> Result<Vec<FrameBuffer>>;

    /// Release the stream's buffers. Only valid while stopped.
    fn free(&self, stream: StreamId) -> Result<()>;

    /// Create the device-side request for `slot`, bound to buffer `slot`.
    fn create_request(&self, stream: StreamId, slot: usize) -> Result<()>;

    fn set_completion_handler(&self, handler: Option<CompletionHandler>);

    fn start(&self, controls: &FrameControls) -> Result<()>;

    /// Submit (or resubmit) the request for `slot`.
    fn queue(&self, slot: usize, controls: &FrameControls) -> Result<()>;

    /// Halt capture. Every request still queued is reported to the handler
    /// as `Cancelled` before this returns.
    fn stop(&self) -> Result<()>;

    /// Give the device back to the system.
    fn release(&self);
}

impl fmt::Debug for dyn CameraDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraDevice").field("id", &self.id()).finish()
    }
}
