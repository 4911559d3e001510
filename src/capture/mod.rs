pub mod allocator;
pub mod buffer;
pub mod device;
pub mod frame;
pub mod handler;
pub mod mmap;
pub mod request;
pub mod session;
pub mod stream;
pub mod v4l2;
pub mod virtual_camera;

pub use device::{CameraDevice, CameraManager, Completion, RequestStatus};
pub use frame::{FrameMetadata, FrameView, PixelFormat};
pub use session::{DeviceSession, SessionState};
pub use stream::{FrameControls, StreamConfiguration, StreamRequest, StreamRole};
pub use v4l2::V4l2CameraManager;
pub use virtual_camera::{VirtualCameraManager, VirtualSpec};
