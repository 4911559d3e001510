//! Per-session buffer reservation

use std::sync::Arc;

use tracing::{info, warn};

use crate::capture::buffer::BufferPool;
use crate::capture::device::CameraDevice;
use crate::capture::stream::StreamId;
use crate::error::{CaptureError, Result};

/// Reserves the fixed buffer set for a stream and frees it exactly once.
///
/// Buffers are allocated once per session, never per frame.
pub struct FrameBufferAllocator {
    device: Arc<dyn CameraDevice>,
    pool: Option<Arc<BufferPool>>,
}

impl FrameBufferAllocator {
    pub fn new(device: Arc<dyn CameraDevice>) -> Self {
        Self { device, pool: None }
    }

    /// Ask the device to reserve buffers for `stream`; returns how many it got.
    pub fn allocate(&mut self, stream: StreamId) -> Result<usize> {
        if self.pool.is_some() {
            return Err(CaptureError::InvalidState(format!(
                "buffers already allocated for stream {}",
                stream.0
            )));
        }

        let buffers = self.device.allocate(stream).map_err(|e| match e {
            CaptureError::AllocationFailed(_) => e,
            other => CaptureError::AllocationFailed(other.to_string()),
        })?;

        if buffers.is_empty() {
            // Nothing was reserved, but the device may still hold bookkeeping.
            if let Err(e) = self.device.free(stream) {
                warn!("Failed to release empty allocation: {}", e);
            }
            return Err(CaptureError::AllocationFailed(
                "device reserved no buffers".into(),
            ));
        }

        let count = buffers.len();
        self.pool = Some(Arc::new(BufferPool::new(stream, buffers)));
        info!("Allocated {} buffers for stream {}", count, stream.0);
        Ok(count)
    }

    pub fn buffers(&self) -> Option<&Arc<BufferPool>> {
        self.pool.as_ref()
    }

    pub fn is_allocated(&self) -> bool {
        self.pool.is_some()
    }

    /// Release every buffer of `stream`. The device must already be stopped.
    pub fn free(&mut self, stream: StreamId) -> Result<()> {
        let pool = match self.pool.take() {
            Some(pool) if pool.stream() == stream => pool,
            Some(pool) => {
                let other = pool.stream();
                self.pool = Some(pool);
                return Err(CaptureError::InvalidState(format!(
                    "stream {} has no buffers (allocated for stream {})",
                    stream.0, other.0
                )));
            }
            None => {
                return Err(CaptureError::InvalidState(format!(
                    "stream {} has no buffers",
                    stream.0
                )))
            }
        };

        let mapped = pool.mapped_planes();
        if mapped > 0 {
            warn!("Freeing buffer pool with {} planes still mapped", mapped);
        }
        drop(pool);

        self.device.free(stream)?;
        info!("Freed buffers for stream {}", stream.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::device::CameraManager;
    use crate::capture::stream::StreamRole;
    use crate::capture::virtual_camera::{VirtualCameraManager, VirtualSpec};

    fn configured(spec: VirtualSpec) -> (Arc<dyn CameraDevice>, StreamId) {
        let manager = VirtualCameraManager::new(vec![spec]);
        let device = manager.acquire("virtual0").unwrap();
        let cfg = device
            .generate_configuration(StreamRole::Viewfinder)
            .unwrap();
        let stream = device.configure(&cfg).unwrap();
        (device, stream)
    }

    #[test]
    fn allocate_reports_pool_size() {
        let (device, stream) = configured(VirtualSpec::new("virtual0"));
        let mut allocator = FrameBufferAllocator::new(device);

        assert_eq!(allocator.allocate(stream).unwrap(), 4);
        assert_eq!(allocator.buffers().unwrap().len(), 4);
        allocator.free(stream).unwrap();
        assert!(!allocator.is_allocated());
    }

    #[test]
    fn device_failure_becomes_allocation_failed() {
        let (device, stream) = configured(VirtualSpec::new("virtual0").failing_allocation());
        let mut allocator = FrameBufferAllocator::new(device);

        assert!(matches!(
            allocator.allocate(stream),
            Err(CaptureError::AllocationFailed(_))
        ));
        assert!(!allocator.is_allocated());
    }

    #[test]
    fn double_allocate_and_double_free_are_rejected() {
        let (device, stream) = configured(VirtualSpec::new("virtual0"));
        let mut allocator = FrameBufferAllocator::new(device);

        allocator.allocate(stream).unwrap();
        assert!(matches!(
            allocator.allocate(stream),
            Err(CaptureError::InvalidState(_))
        ));
        allocator.free(stream).unwrap();
        assert!(matches!(
            allocator.free(stream),
            Err(CaptureError::InvalidState(_))
        ));
    }
}
