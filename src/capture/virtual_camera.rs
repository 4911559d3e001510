//! In-process virtual camera
//!
//! Behaves like a buffer-queue driver: buffers live in memfd regions the core
//! maps through their file descriptors, submissions go into a FIFO queue and
//! completions are reported on a dispatcher thread the camera owns. In manual
//! mode no thread is spawned and completions are driven explicitly with
//! [`VirtualCamera::complete_next`] and [`VirtualCamera::complete`].

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use tracing::{debug, info, warn};

use crate::capture::buffer::{FrameBuffer, Plane};
use crate::capture::device::{
    CameraDevice, CameraManager, Completion, CompletionHandler,
};
use crate::capture::frame::{FrameMetadata, PixelFormat, MAX_PLANES};
use crate::capture::stream::{
    FrameControls, StreamConfiguration, StreamId, StreamRole, ValidationStatus,
};
use crate::error::{CaptureError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create an anonymous memory file of `len` bytes.
pub fn memfd(name: &str, len: usize) -> io::Result<OwnedFd> {
    let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `name` is a valid NUL-terminated string.
    let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor nobody else owns.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    let file = File::from(fd);
    file.set_len(len as u64)?;
    Ok(OwnedFd::from(file))
}

/// Create an anonymous memory file holding `contents`.
pub fn memfd_with_contents(name: &str, contents: &[u8]) -> io::Result<OwnedFd> {
    let mut file = File::from(memfd(name, 0)?);
    file.write_all(contents)?;
    Ok(OwnedFd::from(file))
}

/// Description of a virtual device.
#[derive(Debug, Clone)]
pub struct VirtualSpec {
    pub id: String,
    /// Supported sizes, any order
    pub sizes: Vec<(u32, u32)>,
    pub formats: Vec<PixelFormat>,
    pub default_size: (u32, u32),
    pub buffer_count: u32,
    pub max_buffers: u32,
    pub frame_interval: Duration,
    pub fail_allocation: bool,
    /// `create_request` fails for this slot
    pub fail_request: Option<usize>,
    pub fail_start: bool,
    /// Submissions accepted before `queue` starts failing
    pub queue_limit: Option<usize>,
    /// Append a zero-length plane to every buffer; mapping it always fails
    pub broken_plane: bool,
    pub manual: bool,
}

impl VirtualSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sizes: vec![(320, 240), (640, 480), (1280, 720)],
            formats: vec![PixelFormat::Yuyv, PixelFormat::Nv12, PixelFormat::Yuv420],
            default_size: (640, 480),
            buffer_count: 4,
            max_buffers: 8,
            frame_interval: Duration::from_millis(33),
            fail_allocation: false,
            fail_request: None,
            fail_start: false,
            queue_limit: None,
            broken_plane: false,
            manual: false,
        }
    }

    pub fn with_sizes(mut self, sizes: &[(u32, u32)]) -> Self {
        self.sizes = sizes.to_vec();
        if let Some(&first) = sizes.first() {
            self.default_size = first;
        }
        self
    }

    pub fn with_formats(mut self, formats: &[PixelFormat]) -> Self {
        self.formats = formats.to_vec();
        self
    }

    pub fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn failing_allocation(mut self) -> Self {
        self.fail_allocation = true;
        self
    }

    pub fn failing_request_creation(mut self, slot: usize) -> Self {
        self.fail_request = Some(slot);
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Accept `accepted` submissions (initial fill included), then refuse
    /// every further `queue`.
    pub fn failing_queue_after(mut self, accepted: usize) -> Self {
        self.queue_limit = Some(accepted);
        self
    }

    pub fn with_broken_plane(mut self) -> Self {
        self.broken_plane = true;
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    fn largest_size(&self) -> Option<(u32, u32)> {
        self.sizes.iter().copied().max_by_key(|&(w, h)| w * h)
    }

    /// Largest supported size that fits inside the request, else the smallest.
    fn fit_size(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        self.sizes
            .iter()
            .copied()
            .filter(|&(w, h)| w <= width && h <= height)
            .max_by_key(|&(w, h)| w * h)
            .or_else(|| self.sizes.iter().copied().min_by_key(|&(w, h)| w * h))
    }
}

/// Set of virtual devices with exclusive acquisition.
pub struct VirtualCameraManager {
    specs: Vec<VirtualSpec>,
    held: Arc<Mutex<HashSet<String>>>,
    cameras: Mutex<HashMap<String, Weak<VirtualCamera>>>,
}

impl VirtualCameraManager {
    pub fn new(specs: Vec<VirtualSpec>) -> Self {
        Self {
            specs,
            held: Arc::new(Mutex::new(HashSet::new())),
            cameras: Mutex::new(HashMap::new()),
        }
    }

    /// Concrete handle of an acquired camera, for driving manual completions.
    pub fn camera(&self, id: &str) -> Option<Arc<VirtualCamera>> {
        lock(&self.cameras).get(id).and_then(Weak::upgrade)
    }
}

impl CameraManager for VirtualCameraManager {
    fn list_devices(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.id.clone()).collect()
    }

    fn acquire(&self, id: &str) -> Result<Arc<dyn CameraDevice>> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| CaptureError::NotFound(id.to_string()))?;

        if !lock(&self.held).insert(id.to_string()) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} is already acquired",
                id
            )));
        }

        let camera = Arc::new(VirtualCamera::new(spec.clone(), self.held.clone()));
        lock(&self.cameras).insert(id.to_string(), Arc::downgrade(&camera));
        info!("Acquired virtual camera {}", id);
        Ok(camera)
    }
}

#[derive(Debug, Clone, Copy)]
struct Submission {
    slot: usize,
    controls: FrameControls,
}

/// Producer-side view of one buffer: the "DMA engine" writes through it.
struct ProducerBuffer {
    map: MmapMut,
    layout: [(usize, usize); MAX_PLANES],
    plane_count: usize,
}

impl ProducerBuffer {
    /// Fill every plane with a pattern derived from `sequence`.
    fn fill(&mut self, sequence: u32, timestamp: Duration) -> FrameMetadata {
        let mut used = [0u32; MAX_PLANES];
        for (i, &(offset, len)) in self.layout[..self.plane_count].iter().enumerate() {
            let plane = &mut self.map[offset..offset + len];
            plane.fill(sequence as u8);
            if plane.len() >= 4 {
                plane[..4].copy_from_slice(&sequence.to_le_bytes());
            }
            used[i] = len as u32;
        }
        FrameMetadata::new(sequence, Some(timestamp), &used[..self.plane_count])
    }
}

struct Shared {
    id: String,
    handler: Mutex<Option<CompletionHandler>>,
    producers: Mutex<Vec<ProducerBuffer>>,
    tx: flume::Sender<Submission>,
    rx: flume::Receiver<Submission>,
    running: AtomicBool,
    sequence: AtomicU32,
    submissions: AtomicUsize,
    epoch: Instant,
    last_controls: Mutex<Option<FrameControls>>,
}

impl Shared {
    fn dispatch(&self, completion: Completion) {
        // Never call the handler with a lock held; it resubmits via queue().
        let handler = lock(&self.handler).clone();
        match handler {
            Some(handler) => handler(completion),
            None => debug!("{}: no handler for slot {}", self.id, completion.slot),
        }
    }

    fn produce(&self, submission: Submission) {
        let metadata = {
            let mut producers = lock(&self.producers);
            let Some(buffer) = producers.get_mut(submission.slot) else {
                warn!("{}: completion for unknown slot {}", self.id, submission.slot);
                return;
            };
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            buffer.fill(sequence, self.epoch.elapsed())
        };
        self.dispatch(Completion::success(submission.slot, metadata));
    }

    fn run(&self, interval: Duration) {
        while self.running.load(Ordering::Acquire) {
            let submission = match self.rx.recv_timeout(interval) {
                Ok(submission) => submission,
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => break,
            };

            thread::sleep(frame_interval(interval, &submission.controls));
            if !self.running.load(Ordering::Acquire) {
                // Hand it back so stop() reports it as cancelled.
                let _ = self.tx.send(submission);
                break;
            }
            self.produce(submission);
        }
        debug!("{}: dispatcher exiting", self.id);
    }
}

/// Time the sensor spends on one frame: its native interval, held inside
/// the request's frame-duration limits.
fn frame_interval(native: Duration, controls: &FrameControls) -> Duration {
    match controls.frame_duration_limits {
        Some(limits) => native.max(limits.min()).min(limits.max()),
        None => native,
    }
}

#[derive(Default)]
struct DeviceState {
    config: Option<StreamConfiguration>,
    stream: Option<StreamId>,
    requests: Vec<bool>,
    started: bool,
    released: bool,
}

/// An acquired virtual device.
pub struct VirtualCamera {
    spec: VirtualSpec,
    held: Arc<Mutex<HashSet<String>>>,
    state: Mutex<DeviceState>,
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl VirtualCamera {
    fn new(spec: VirtualSpec, held: Arc<Mutex<HashSet<String>>>) -> Self {
        let (tx, rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            id: spec.id.clone(),
            handler: Mutex::new(None),
            producers: Mutex::new(Vec::new()),
            tx,
            rx,
            running: AtomicBool::new(false),
            sequence: AtomicU32::new(0),
            submissions: AtomicUsize::new(0),
            epoch: Instant::now(),
            last_controls: Mutex::new(None),
        });
        Self {
            spec,
            held,
            state: Mutex::new(DeviceState::default()),
            shared,
            dispatcher: Mutex::new(None),
        }
    }

    /// Requests currently waiting in the device queue
    pub fn queued_len(&self) -> usize {
        self.shared.rx.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Controls carried by the most recent submission
    pub fn last_controls(&self) -> Option<FrameControls> {
        *lock(&self.shared.last_controls)
    }

    /// Complete the oldest queued request. Returns its slot.
    pub fn complete_next(&self) -> Option<usize> {
        if !self.is_running() {
            return None;
        }
        let submission = self.shared.rx.try_recv().ok()?;
        self.shared.produce(submission);
        Some(submission.slot)
    }

    /// Complete the queued request for `slot` ahead of the others.
    pub fn complete(&self, slot: usize) -> bool {
        if !self.is_running() {
            return false;
        }
        let pending: Vec<Submission> = self.shared.rx.try_iter().collect();
        let mut target = None;
        for submission in pending {
            if target.is_none() && submission.slot == slot {
                target = Some(submission);
            } else {
                let _ = self.shared.tx.send(submission);
            }
        }
        match target {
            Some(submission) => {
                self.shared.produce(submission);
                true
            }
            None => false,
        }
    }

    fn allocate_buffers(&self, config: &StreamConfiguration) -> io::Result<Vec<FrameBuffer>> {
        let sizes = config.format.plane_sizes(config.width, config.height);
        let plane_count = config.format.plane_count();
        let total: usize = sizes[..plane_count].iter().sum();

        let mut buffers = Vec::with_capacity(config.buffer_count as usize);
        let mut producers = Vec::with_capacity(config.buffer_count as usize);

        for index in 0..config.buffer_count as usize {
            let fd = Arc::new(memfd(&format!("{}-buf{}", self.spec.id, index), total)?);

            let mut layout = [(0, 0); MAX_PLANES];
            let mut planes = Vec::with_capacity(plane_count + 1);
            let mut offset = 0;
            for (i, &len) in sizes[..plane_count].iter().enumerate() {
                layout[i] = (offset, len);
                planes.push(Plane::new(fd.clone(), offset as u64, len));
                offset += len;
            }
            if self.spec.broken_plane && plane_count < MAX_PLANES {
                planes.push(Plane::new(fd.clone(), offset as u64, 0));
            }

            let file = File::from(fd.try_clone()?);
            // SAFETY: the memfd is private to this process and only written
            // through this mapping.
            let map = unsafe { MmapMut::map_mut(&file)? };
            producers.push(ProducerBuffer {
                map,
                layout,
                plane_count,
            });
            buffers.push(FrameBuffer::new(index, planes));
        }

        *lock(&self.shared.producers) = producers;
        Ok(buffers)
    }

    fn halt(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = lock(&self.dispatcher).take() {
            if handle.join().is_err() {
                warn!("{}: dispatcher thread panicked", self.spec.id);
            }
        }
        let cancelled: Vec<Submission> = self.shared.rx.try_iter().collect();
        for submission in cancelled {
            self.shared.dispatch(Completion::cancelled(submission.slot));
        }
    }
}

impl CameraDevice for VirtualCamera {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn generate_configuration(&self, role: StreamRole) -> Result<StreamConfiguration> {
        let format = *self.spec.formats.first().ok_or_else(|| {
            CaptureError::ConfigurationRejected(format!("{} has no formats", self.spec.id))
        })?;
        let (width, height) = match role {
            StreamRole::StillCapture | StreamRole::Raw => self.spec.largest_size(),
            StreamRole::Viewfinder | StreamRole::VideoRecording => Some(self.spec.default_size),
        }
        .ok_or_else(|| {
            CaptureError::ConfigurationRejected(format!("{} has no sizes", self.spec.id))
        })?;

        Ok(StreamConfiguration {
            role,
            format,
            width,
            height,
            buffer_count: self.spec.buffer_count,
            frame_duration_limits: None,
        })
    }

    fn validate(&self, config: &mut StreamConfiguration) -> ValidationStatus {
        let Some((width, height)) = self.spec.fit_size(config.width, config.height) else {
            return ValidationStatus::Invalid;
        };
        let Some(&fallback_format) = self.spec.formats.first() else {
            return ValidationStatus::Invalid;
        };

        let mut status = ValidationStatus::Valid;
        if (width, height) != config.size() {
            config.width = width;
            config.height = height;
            status = ValidationStatus::Adjusted;
        }
        if !self.spec.formats.contains(&config.format) {
            config.format = fallback_format;
            status = ValidationStatus::Adjusted;
        }
        let count = config.buffer_count.clamp(1, self.spec.max_buffers);
        if count != config.buffer_count {
            config.buffer_count = count;
            status = ValidationStatus::Adjusted;
        }
        status
    }

    fn configure(&self, config: &StreamConfiguration) -> Result<StreamId> {
        let mut check = *config;
        if self.validate(&mut check) != ValidationStatus::Valid {
            return Err(CaptureError::ConfigurationRejected(format!(
                "{} is not a validated configuration",
                config
            )));
        }

        let mut state = lock(&self.state);
        if state.started {
            return Err(CaptureError::InvalidState("camera is running".into()));
        }
        state.config = Some(*config);
        let stream = StreamId(0);
        state.stream = Some(stream);
        Ok(stream)
    }

    fn allocate(&self, stream: StreamId) -> Result<Vec<FrameBuffer>> {
        let mut state = lock(&self.state);
        let config = match (state.stream, state.config) {
            (Some(s), Some(config)) if s == stream => config,
            _ => {
                return Err(CaptureError::AllocationFailed(format!(
                    "stream {} is not configured",
                    stream.0
                )))
            }
        };
        if self.spec.fail_allocation {
            return Err(CaptureError::AllocationFailed(
                "simulated out of memory".into(),
            ));
        }

        let buffers = self
            .allocate_buffers(&config)
            .map_err(|e| CaptureError::AllocationFailed(e.to_string()))?;
        state.requests = vec![false; buffers.len()];
        Ok(buffers)
    }

    fn free(&self, stream: StreamId) -> Result<()> {
        let mut state = lock(&self.state);
        if state.started {
            return Err(CaptureError::InvalidState(
                "cannot free buffers while streaming".into(),
            ));
        }
        if state.stream != Some(stream) {
            return Err(CaptureError::InvalidState(format!(
                "stream {} is not configured",
                stream.0
            )));
        }
        state.requests.clear();
        lock(&self.shared.producers).clear();
        Ok(())
    }

    fn create_request(&self, stream: StreamId, slot: usize) -> Result<()> {
        let mut state = lock(&self.state);
        if state.stream != Some(stream) {
            return Err(CaptureError::RequestCreationFailed {
                slot,
                reason: format!("stream {} is not configured", stream.0),
            });
        }
        if self.spec.fail_request == Some(slot) {
            return Err(CaptureError::RequestCreationFailed {
                slot,
                reason: "simulated request exhaustion".into(),
            });
        }
        match state.requests.get_mut(slot) {
            Some(created) => {
                *created = true;
                Ok(())
            }
            None => Err(CaptureError::RequestCreationFailed {
                slot,
                reason: "no buffer for slot".into(),
            }),
        }
    }

    fn set_completion_handler(&self, handler: Option<CompletionHandler>) {
        *lock(&self.shared.handler) = handler;
    }

    fn start(&self, controls: &FrameControls) -> Result<()> {
        let mut state = lock(&self.state);
        if state.started {
            return Err(CaptureError::InvalidState("camera already started".into()));
        }
        if state.requests.is_empty() {
            return Err(CaptureError::AllocationFailed(
                "no buffers allocated".into(),
            ));
        }
        if self.spec.fail_start {
            return Err(CaptureError::Io(io::Error::new(
                io::ErrorKind::Other,
                "simulated sensor power-up failure",
            )));
        }
        state.started = true;
        self.shared.running.store(true, Ordering::Release);

        if !self.spec.manual {
            debug!(
                "{}: native interval {:?}, first frame {:?}",
                self.spec.id,
                self.spec.frame_interval,
                frame_interval(self.spec.frame_interval, controls)
            );
            let interval = self.spec.frame_interval;
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-dispatch", self.spec.id))
                .spawn(move || shared.run(interval))?;
            *lock(&self.dispatcher) = Some(handle);
        }
        info!("Virtual camera {} started", self.spec.id);
        Ok(())
    }

    fn queue(&self, slot: usize, controls: &FrameControls) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(CaptureError::QueueFailed {
                slot,
                reason: "camera is not running".into(),
            });
        }
        let accepted = self.shared.submissions.fetch_add(1, Ordering::AcqRel);
        if self.spec.queue_limit.is_some_and(|limit| accepted >= limit) {
            return Err(CaptureError::QueueFailed {
                slot,
                reason: "simulated queue overflow".into(),
            });
        }
        *lock(&self.shared.last_controls) = Some(*controls);
        self.shared
            .tx
            .send(Submission {
                slot,
                controls: *controls,
            })
            .map_err(|e| CaptureError::QueueFailed {
                slot,
                reason: e.to_string(),
            })
    }

    fn stop(&self) -> Result<()> {
        let was_started = std::mem::replace(&mut lock(&self.state).started, false);
        if was_started {
            self.halt();
            info!("Virtual camera {} stopped", self.spec.id);
        }
        Ok(())
    }

    fn release(&self) {
        let _ = self.stop();
        let mut state = lock(&self.state);
        if !state.released {
            state.released = true;
            lock(&self.held).remove(&self.spec.id);
            info!("Released virtual camera {}", self.spec.id);
        }
    }
}

impl Drop for VirtualCamera {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::stream::FrameDurationLimits;

    #[test]
    fn acquisition_is_exclusive_until_release() {
        let manager = VirtualCameraManager::new(vec![VirtualSpec::new("cam")]);
        let device = manager.acquire("cam").unwrap();
        assert!(matches!(
            manager.acquire("cam"),
            Err(CaptureError::DeviceUnavailable(_))
        ));
        device.release();
        assert!(manager.acquire("cam").is_ok());
    }

    #[test]
    fn unknown_id_is_not_found() {
        let manager = VirtualCameraManager::new(vec![VirtualSpec::new("cam")]);
        assert!(matches!(
            manager.acquire("nope"),
            Err(CaptureError::NotFound(_))
        ));
        assert_eq!(manager.list_devices(), vec!["cam".to_string()]);
    }

    #[test]
    fn validation_clamps_to_supported_size() {
        let manager = VirtualCameraManager::new(vec![
            VirtualSpec::new("cam").with_sizes(&[(640, 480), (1280, 720)])
        ]);
        let device = manager.acquire("cam").unwrap();
        let mut cfg = device
            .generate_configuration(StreamRole::Viewfinder)
            .unwrap();
        cfg.width = 1920;
        cfg.height = 1080;

        assert_eq!(device.validate(&mut cfg), ValidationStatus::Adjusted);
        assert_eq!(cfg.size(), (1280, 720));
        assert_eq!(device.validate(&mut cfg), ValidationStatus::Valid);
    }

    #[test]
    fn unvalidated_configuration_is_rejected() {
        let manager = VirtualCameraManager::new(vec![VirtualSpec::new("cam")]);
        let device = manager.acquire("cam").unwrap();
        let mut cfg = device
            .generate_configuration(StreamRole::Viewfinder)
            .unwrap();
        cfg.buffer_count = 64;
        assert!(matches!(
            device.configure(&cfg),
            Err(CaptureError::ConfigurationRejected(_))
        ));
    }

    #[test]
    fn frame_interval_is_held_inside_duration_limits() {
        let native = Duration::from_millis(33);
        let mut controls = FrameControls::default();
        assert_eq!(frame_interval(native, &controls), native);

        controls.frame_duration_limits = Some(FrameDurationLimits::new(40_000, 50_000));
        assert_eq!(frame_interval(native, &controls), Duration::from_millis(40));

        controls.frame_duration_limits = Some(FrameDurationLimits::new(5_000, 10_000));
        assert_eq!(frame_interval(native, &controls), Duration::from_millis(10));
    }

    #[test]
    fn queue_refuses_submissions_past_the_limit() {
        let manager =
            VirtualCameraManager::new(vec![VirtualSpec::new("cam").manual().failing_queue_after(2)]);
        let device = manager.acquire("cam").unwrap();
        let cfg = device
            .generate_configuration(StreamRole::Viewfinder)
            .unwrap();
        let stream = device.configure(&cfg).unwrap();
        device.allocate(stream).unwrap();
        device.start(&FrameControls::default()).unwrap();

        let controls = FrameControls::default();
        assert!(device.queue(0, &controls).is_ok());
        assert!(device.queue(1, &controls).is_ok());
        assert!(matches!(
            device.queue(2, &controls),
            Err(CaptureError::QueueFailed { slot: 2, .. })
        ));
    }

    #[test]
    fn stop_cancels_everything_still_queued() {
        let manager = VirtualCameraManager::new(vec![VirtualSpec::new("cam").manual()]);
        let device = manager.acquire("cam").unwrap();
        let cfg = device
            .generate_configuration(StreamRole::Viewfinder)
            .unwrap();
        let stream = device.configure(&cfg).unwrap();
        let buffers = device.allocate(stream).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        device.set_completion_handler(Some(Arc::new(move |c: Completion| {
            lock(&sink).push((c.slot, c.status));
        })));

        device.start(&FrameControls::default()).unwrap();
        for slot in 0..buffers.len() {
            device.create_request(stream, slot).unwrap();
            device.queue(slot, &FrameControls::default()).unwrap();
        }
        device.stop().unwrap();

        let seen = lock(&seen);
        assert_eq!(seen.len(), 4);
        assert!(seen
            .iter()
            .all(|&(_, s)| s == crate::capture::device::RequestStatus::Cancelled));
        assert!(device.queue(0, &FrameControls::default()).is_err());
    }
}
