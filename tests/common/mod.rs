#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use aperture::capture::virtual_camera::VirtualCamera;
use aperture::capture::{DeviceSession, FrameView, StreamRequest, StreamRole};
use aperture::capture::{VirtualCameraManager, VirtualSpec};
use aperture::sink::{FrameSink, SinkError};

/// What a sink saw of one delivered frame
#[derive(Debug, Clone)]
pub struct Captured {
    pub device: usize,
    pub sequence: u32,
    pub width: u32,
    pub height: u32,
    /// First four bytes of plane 0
    pub head: [u8; 4],
    pub planes_present: Vec<bool>,
    pub complete: bool,
}

/// Records every frame it receives.
#[derive(Default)]
pub struct CollectingSink {
    frames: Mutex<Vec<Captured>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<Captured> {
        self.frames.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl FrameSink for CollectingSink {
    fn deliver(&self, frame: &FrameView<'_>) -> Result<(), SinkError> {
        let mut head = [0u8; 4];
        if let Some(data) = frame.plane(0) {
            let n = data.len().min(4);
            head[..n].copy_from_slice(&data[..n]);
        }
        self.frames.lock().unwrap().push(Captured {
            device: frame.device,
            sequence: frame.sequence(),
            width: frame.width,
            height: frame.height,
            head,
            planes_present: frame.planes().map(|p| p.is_some()).collect(),
            complete: frame.is_complete(),
        });
        Ok(())
    }
}

/// Rejects every frame.
#[derive(Default)]
pub struct FailingSink {
    pub calls: AtomicUsize,
}

impl FrameSink for FailingSink {
    fn deliver(&self, _frame: &FrameView<'_>) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Rejected("disk full".into()))
    }
}

/// Panics on every frame.
#[derive(Default)]
pub struct PanickingSink {
    pub calls: AtomicUsize,
}

impl FrameSink for PanickingSink {
    fn deliver(&self, _frame: &FrameView<'_>) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("sink bug");
    }
}

/// Holds the completion thread for `delay` on every frame.
pub struct SlowSink {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl SlowSink {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

impl FrameSink for SlowSink {
    fn deliver(&self, _frame: &FrameView<'_>) -> Result<(), SinkError> {
        thread::sleep(self.delay);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Open and configure a session on a single virtual camera. The camera
/// handle lets tests drive manual-mode completions.
pub fn configured_session(
    spec: VirtualSpec,
    sink: Arc<dyn FrameSink>,
) -> (Arc<VirtualCamera>, DeviceSession) {
    let id = spec.id.clone();
    let manager = VirtualCameraManager::new(vec![spec]);
    let mut session = DeviceSession::open(&manager, &id, 0, sink).unwrap();
    session
        .configure(StreamRole::Viewfinder, &StreamRequest::default())
        .unwrap();
    let camera = manager.camera(&id).unwrap();
    (camera, session)
}

/// `queued + completed` for a running session
pub fn in_circulation(session: &DeviceSession) -> usize {
    let (queued, completed) = session.requests().unwrap().counts();
    queued + completed
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
