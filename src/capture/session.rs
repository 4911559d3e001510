//! Device session: acquire, configure, stream, tear down
//!
//! ```text
//! Idle --configure--> Configured --start--> Running --stop--> Stopped
//!                          \________________________stop______/
//! ```
//!
//! `stop()` is idempotent. From `Idle` it does nothing (the acquisition is
//! released when the session is dropped); from `Stopped` it does nothing.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::capture::allocator::FrameBufferAllocator;
use crate::capture::buffer::BufferPool;
use crate::capture::device::{CameraDevice, CameraManager};
use crate::capture::handler::{FrameHandler, SessionStats};
use crate::capture::request::RequestPool;
use crate::capture::stream::{
    FrameControls, StreamConfiguration, StreamId, StreamRequest, StreamRole, ValidationStatus,
};
use crate::error::{CaptureError, Result};
use crate::sink::FrameSink;
use crate::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Running,
    Stopped,
}

/// Exclusive ownership of one camera for the lifetime of a capture run.
pub struct DeviceSession {
    index: usize,
    device: Arc<dyn CameraDevice>,
    state: SessionState,
    config: Option<StreamConfiguration>,
    stream: Option<StreamId>,
    controls: FrameControls,
    allocator: FrameBufferAllocator,
    requests: Option<Arc<RequestPool>>,
    handler: Option<Arc<FrameHandler>>,
    sink: Arc<dyn FrameSink>,
    stats: Arc<SessionStats>,
}

impl DeviceSession {
    /// Resolve and exclusively acquire camera `id`.
    ///
    /// `index` identifies this session among the running ones (logs, metric
    /// labels, sink file names).
    #[instrument(skip(manager, sink))]
    pub fn open(
        manager: &dyn CameraManager,
        id: &str,
        index: usize,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self> {
        let device = manager.acquire(id)?;
        info!("Camera {} opened as device {}", id, index);

        Ok(Self {
            index,
            allocator: FrameBufferAllocator::new(device.clone()),
            device,
            state: SessionState::Idle,
            config: None,
            stream: None,
            controls: FrameControls::default(),
            requests: None,
            handler: None,
            sink,
            stats: Arc::new(SessionStats::new(index)),
        })
    }

    /// Negotiate the stream for `role`, applying `request` on top of the
    /// device default. Returns the configuration the device validated, which
    /// may differ from what was asked for.
    #[instrument(skip(self), fields(device = self.index))]
    pub fn configure(
        &mut self,
        role: StreamRole,
        request: &StreamRequest,
    ) -> Result<StreamConfiguration> {
        if !matches!(self.state, SessionState::Idle | SessionState::Configured) {
            return Err(CaptureError::InvalidState(format!(
                "cannot configure in {:?}",
                self.state
            )));
        }

        let mut config = self.device.generate_configuration(role)?;
        debug!("Default {:?} configuration: {}", role, config);
        request.apply(&mut config);
        let requested = config;

        match self.device.validate(&mut config) {
            ValidationStatus::Valid => {}
            ValidationStatus::Adjusted => {
                warn!("Configuration adjusted: requested {}, got {}", requested, config)
            }
            ValidationStatus::Invalid => {
                return Err(CaptureError::ConfigurationRejected(format!(
                    "{} cannot produce any configuration for {:?}",
                    self.device.id(),
                    role
                )))
            }
        }

        let stream = self.device.configure(&config)?;
        info!("Validated configuration: {}", config);

        self.config = Some(config);
        self.stream = Some(stream);
        self.state = SessionState::Configured;
        Ok(config)
    }

    /// Controls applied to every request submission. Not allowed while running.
    pub fn set_controls(&mut self, controls: FrameControls) -> Result<()> {
        if self.state == SessionState::Running {
            return Err(CaptureError::InvalidState(
                "controls cannot change while running".into(),
            ));
        }
        if !controls.is_empty() {
            debug!("Per-request controls: {:?}", controls);
        }
        self.controls = controls;
        Ok(())
    }

    /// Reserve buffers, bind one request per buffer, start the device and
    /// submit every request in buffer order.
    ///
    /// If buffer reservation fails nothing is submitted and the device is
    /// never started.
    #[instrument(skip(self), fields(device = self.index))]
    pub fn start(&mut self) -> Result<()> {
        let (config, stream) = match (self.state, self.config, self.stream) {
            (SessionState::Configured, Some(config), Some(stream)) => (config, stream),
            (state, _, _) => {
                return Err(CaptureError::InvalidState(format!(
                    "cannot start in {:?}",
                    state
                )))
            }
        };

        let count = match self.allocator.allocate(stream) {
            Ok(count) => count,
            Err(e) => {
                error!("Buffer allocation failed: {}", e);
                return Err(e);
            }
        };
        let Some(buffers) = self.allocator.buffers().cloned() else {
            return Err(CaptureError::AllocationFailed(
                "allocator returned no pool".into(),
            ));
        };

        let requests = Arc::new(RequestPool::new(stream, count));
        for slot in 0..count {
            if let Err(e) = self.device.create_request(stream, slot) {
                error!("Cannot create request {}: {}", slot, e);
                self.free_buffers(stream);
                return Err(e);
            }
        }

        let handler = Arc::new(FrameHandler::new(
            self.index,
            &self.device,
            buffers,
            requests.clone(),
            self.sink.clone(),
            config,
            self.controls,
            self.stats.clone(),
        ));
        let callback = handler.clone();
        self.device
            .set_completion_handler(Some(Arc::new(move |completion| {
                callback.on_complete(completion)
            })));

        if let Err(e) = self.device.start(&self.controls) {
            error!("Device failed to start: {}", e);
            self.device.set_completion_handler(None);
            self.free_buffers(stream);
            return Err(e);
        }

        self.requests = Some(requests.clone());
        self.handler = Some(handler);
        self.state = SessionState::Running;

        for slot in 0..count {
            let queued = requests
                .submit(slot)
                .and_then(|_| self.device.queue(slot, &self.controls));
            if let Err(e) = queued {
                error!("Initial submission of request {} failed: {}", slot, e);
                self.stop();
                return Err(e);
            }
        }

        info!("Streaming with {} requests in flight", count);
        Ok(())
    }

    /// Halt frame delivery, drain the device queue, free buffers and release
    /// the camera. Safe to call repeatedly; teardown errors are logged and do
    /// not prevent the remaining steps.
    #[instrument(skip(self), fields(device = self.index))]
    pub fn stop(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Stopped => {
                debug!("stop() ignored in {:?}", self.state);
                return;
            }
            SessionState::Running => self.halt_streaming(),
            SessionState::Configured => {}
        }

        if let Some(stream) = self.stream {
            if self.allocator.is_allocated() {
                self.free_buffers(stream);
            }
        }
        self.device.release();
        self.state = SessionState::Stopped;

        let stats = self.stats.snapshot();
        info!(
            "Session stopped: {} frames delivered, {} dropped",
            stats.frames_delivered, stats.frames_dropped
        );
    }

    fn halt_streaming(&mut self) {
        if let Some(handler) = &self.handler {
            handler.begin_stop();
        }
        if let Err(e) = self.device.stop() {
            warn!("Device stop failed: {}", e);
        }
        self.device.set_completion_handler(None);
        self.handler = None;

        if let Some(requests) = &self.requests {
            if !requests.is_drained() {
                let (queued, completed) = requests.counts();
                warn!(
                    "{} queued and {} completed requests outstanding after stop; retiring",
                    queued, completed
                );
                for slot in 0..requests.size() {
                    let _ = requests.retire(slot);
                }
            }
        }
    }

    fn free_buffers(&mut self, stream: StreamId) {
        if let Err(e) = self.allocator.free(stream) {
            warn!("Failed to free buffers: {}", e);
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device_id(&self) -> &str {
        self.device.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Validated stream configuration, once configured
    pub fn configuration(&self) -> Option<&StreamConfiguration> {
        self.config.as_ref()
    }

    pub fn controls(&self) -> FrameControls {
        self.controls
    }

    /// Number of buffers (and requests) cycling through the device
    pub fn pool_size(&self) -> Option<usize> {
        self.requests.as_ref().map(|r| r.size())
    }

    pub fn requests(&self) -> Option<&Arc<RequestPool>> {
        self.requests.as_ref()
    }

    pub fn buffers(&self) -> Option<&Arc<BufferPool>> {
        self.allocator.buffers()
    }

    pub fn stats(&self) -> Metrics {
        self.stats.snapshot()
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("index", &self.index)
            .field("device", &self.device.id())
            .field("state", &self.state)
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.stop();
        if self.state == SessionState::Idle {
            self.device.release();
        }
    }
}
