//! V4L2 capture backend with exported DMA-BUF planes
//!
//! Buffers are reserved with REQBUFS(MMAP) and exported with EXPBUF so every
//! plane carries its own file descriptor. Drivers without EXPBUF fall back to
//! the classic video-node mapping at the QUERYBUF offset. A dispatcher thread
//! polls the device, dequeues filled buffers and reports them as completions.

use std::collections::HashSet;
use std::ffi::c_void;
use std::io;
use std::mem;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::raw::c_int;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::device::Handle;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{
    v4l2_buffer, v4l2_control, v4l2_exportbuffer, v4l2_format, v4l2_requestbuffers,
};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC, Fraction};

use crate::capture::buffer::{FrameBuffer, Plane};
use crate::capture::device::{CameraDevice, CameraManager, Completion, CompletionHandler};
use crate::capture::frame::{FrameMetadata, PixelFormat};
use crate::capture::stream::{
    FocusMode, FrameControls, StreamConfiguration, StreamId, StreamRole, ValidationStatus,
};
use crate::error::{CaptureError, Result};
use crate::utils;

const V4L2_CID_FOCUS_AUTO: u32 = 0x009a_090c;
const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
const MIN_BUFFERS: u32 = 2;
const MAX_BUFFERS: u32 = 32;
const POLL_TIMEOUT_MS: u16 = 100;

macro_rules! xioctl {
    ($fd:expr, $request:ident, $arg:expr) => {
        // SAFETY: `$arg` is a live, correctly typed argument for `$request`.
        unsafe {
            v4l2::ioctl(
                $fd,
                v4l2::vidioc::$request,
                $arg as *mut _ as *mut c_void,
            )
        }
    };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn capture_type() -> u32 {
    Type::VideoCapture as u32
}

/// EBUSY from a format or buffer ioctl: another process owns streaming I/O.
fn ownership_error(path: &str, e: io::Error) -> CaptureError {
    match e.raw_os_error() {
        Some(libc::EBUSY) => {
            CaptureError::DeviceUnavailable(format!("{} is in use by another process", path))
        }
        _ => CaptureError::Io(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    /// A filled buffer can be dequeued
    Ready,
    /// Nothing is queued to the driver
    Starved,
    Idle,
}

fn readiness(revents: Option<PollFlags>) -> Readiness {
    let revents = revents.unwrap_or(PollFlags::empty());
    if revents.contains(PollFlags::POLLIN) {
        Readiness::Ready
    } else if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
        Readiness::Starved
    } else {
        Readiness::Idle
    }
}

/// Opens `/dev/video*` nodes exclusively within this process.
#[derive(Default)]
pub struct V4l2CameraManager {
    held: Arc<Mutex<HashSet<String>>>,
}

impl V4l2CameraManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CameraManager for V4l2CameraManager {
    fn list_devices(&self) -> Vec<String> {
        utils::list_capture_devices()
    }

    #[instrument(skip(self))]
    fn acquire(&self, id: &str) -> Result<Arc<dyn CameraDevice>> {
        if !Path::new(id).exists() {
            return Err(CaptureError::NotFound(id.to_string()));
        }
        if !lock(&self.held).insert(id.to_string()) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} is already open in this process",
                id
            )));
        }

        match V4l2Camera::open(id, self.held.clone()) {
            Ok(camera) => Ok(Arc::new(camera)),
            Err(e) => {
                lock(&self.held).remove(id);
                Err(e)
            }
        }
    }
}

#[derive(Default)]
struct DeviceState {
    config: Option<StreamConfiguration>,
    stream: Option<StreamId>,
    requests: Vec<bool>,
    streaming: bool,
    released: bool,
}

/// State shared with the dispatcher thread.
struct Shared {
    path: String,
    handle: Arc<Handle>,
    handler: Mutex<Option<CompletionHandler>>,
    /// Slots currently owned by the driver
    queued: Mutex<Vec<bool>>,
    running: AtomicBool,
}

impl Shared {
    fn fd(&self) -> c_int {
        self.handle.fd()
    }

    fn dispatch(&self, completion: Completion) {
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            handler(completion);
        }
    }

    fn run(&self) {
        // SAFETY: `handle` keeps the descriptor open for this thread's lifetime.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd()) };

        let mut starved = false;
        while self.running.load(Ordering::Acquire) {
            let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("{}: poll failed: {}", self.path, e);
                    break;
                }
            }

            match readiness(fds[0].revents()) {
                Readiness::Ready => starved = false,
                Readiness::Idle => continue,
                Readiness::Starved => {
                    if !starved {
                        warn!("{}: no buffers queued, waiting for resubmission", self.path);
                        starved = true;
                    }
                    thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS.into()));
                    continue;
                }
            }

            match self.dequeue() {
                Ok(Some(completion)) => self.dispatch(completion),
                Ok(None) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                    warn!("{}: device disappeared", self.path);
                    break;
                }
                Err(e) => warn!("{}: dequeue failed: {}", self.path, e),
            }
        }
        debug!("{}: dispatcher exiting", self.path);
    }

    fn dequeue(&self) -> io::Result<Option<Completion>> {
        let mut buf = v4l2_buffer {
            type_: capture_type(),
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        if let Err(e) = xioctl!(self.fd(), VIDIOC_DQBUF, &mut buf) {
            return match e.raw_os_error() {
                Some(libc::EAGAIN) => Ok(None),
                _ => Err(e),
            };
        }

        let slot = buf.index as usize;
        if let Some(queued) = lock(&self.queued).get_mut(slot) {
            *queued = false;
        }
        if buf.flags & V4L2_BUF_FLAG_ERROR != 0 {
            debug!("{}: buffer {} flagged as corrupted", self.path, slot);
        }

        let timestamp = Duration::from_secs(buf.timestamp.tv_sec as u64)
            + Duration::from_micros(buf.timestamp.tv_usec as u64);
        let metadata = FrameMetadata::new(buf.sequence, Some(timestamp), &[buf.bytesused]);
        Ok(Some(Completion::success(slot, metadata)))
    }
}

/// An open V4L2 capture node
pub struct V4l2Camera {
    device: Device,
    held: Arc<Mutex<HashSet<String>>>,
    state: Mutex<DeviceState>,
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl V4l2Camera {
    fn open(path: &str, held: Arc<Mutex<HashSet<String>>>) -> Result<Self> {
        let device = Device::with_path(path).map_err(|e| match e.raw_os_error() {
            Some(libc::EBUSY) => CaptureError::DeviceUnavailable(path.to_string()),
            Some(libc::ENOENT) | Some(libc::ENODEV) => CaptureError::NotFound(path.to_string()),
            _ => CaptureError::Io(e),
        })?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE | CapFlags::STREAMING) {
            return Err(CaptureError::NotFound(format!(
                "{} does not support streaming capture",
                path
            )));
        }

        let shared = Arc::new(Shared {
            path: path.to_string(),
            handle: device.handle(),
            handler: Mutex::new(None),
            queued: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        });

        let camera = Self {
            device,
            held,
            state: Mutex::new(DeviceState::default()),
            shared,
            dispatcher: Mutex::new(None),
        };

        // Opening never fails for a node another process is streaming from;
        // releasing its (empty) buffer set does.
        if let Err(e) = camera.request_buffers(0) {
            match ownership_error(path, e) {
                busy @ CaptureError::DeviceUnavailable(_) => return Err(busy),
                other => debug!("{}: REQBUFS(0) at open: {}", path, other),
            }
        }
        Ok(camera)
    }

    fn fd(&self) -> c_int {
        self.shared.fd()
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: capture_type(),
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        xioctl!(self.fd(), VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    /// One plane per buffer: an exported DMA-BUF, or the video node itself
    /// at the buffer's mmap offset.
    fn export_plane(&self, index: u32) -> io::Result<Plane> {
        let mut buf = v4l2_buffer {
            index,
            type_: capture_type(),
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        xioctl!(self.fd(), VIDIOC_QUERYBUF, &mut buf)?;
        let length = buf.length as usize;

        let mut expbuf = v4l2_exportbuffer {
            type_: capture_type(),
            index,
            plane: 0,
            flags: (libc::O_RDONLY | libc::O_CLOEXEC) as u32,
            ..unsafe { mem::zeroed() }
        };
        match xioctl!(self.fd(), VIDIOC_EXPBUF, &mut expbuf) {
            Ok(()) => {
                // SAFETY: EXPBUF hands us a new descriptor we now own.
                let fd = unsafe { OwnedFd::from_raw_fd(expbuf.fd) };
                Ok(Plane::new(Arc::new(fd), 0, length))
            }
            Err(e) => {
                debug!("EXPBUF unavailable ({}), mapping through the video node", e);
                // SAFETY: the device handle outlives this borrow.
                let node = unsafe { BorrowedFd::borrow_raw(self.fd()) }.try_clone_to_owned()?;
                // SAFETY: QUERYBUF filled the `offset` member for MMAP buffers.
                let offset = unsafe { buf.m.offset };
                Ok(Plane::new(Arc::new(node), u64::from(offset), length))
            }
        }
    }

    fn try_format(&self, config: &StreamConfiguration) -> io::Result<(u32, u32, [u8; 4])> {
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = capture_type();
        // SAFETY: `pix` is the active member for VIDEO_CAPTURE formats.
        unsafe {
            fmt.fmt.pix.width = config.width;
            fmt.fmt.pix.height = config.height;
            fmt.fmt.pix.pixelformat = u32::from_le_bytes(config.format.fourcc());
        }
        xioctl!(self.fd(), VIDIOC_TRY_FMT, &mut fmt)?;
        // SAFETY: as above.
        let pix = unsafe { fmt.fmt.pix };
        Ok((pix.width, pix.height, pix.pixelformat.to_le_bytes()))
    }

    fn apply_controls(&self, controls: &FrameControls) {
        if controls.is_empty() {
            return;
        }
        if let Some(mode) = controls.focus_mode {
            let mut ctrl = v4l2_control {
                id: V4L2_CID_FOCUS_AUTO,
                value: i32::from(mode == FocusMode::Continuous || mode == FocusMode::Auto),
            };
            if let Err(e) = xioctl!(self.fd(), VIDIOC_S_CTRL, &mut ctrl) {
                warn!("{}: focus control not applied: {}", self.shared.path, e);
            }
        }
    }

    fn halt(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = lock(&self.dispatcher).take() {
            if handle.join().is_err() {
                warn!("{}: dispatcher thread panicked", self.shared.path);
            }
        }

        let mut kind = capture_type() as c_int;
        if let Err(e) = xioctl!(self.fd(), VIDIOC_STREAMOFF, &mut kind) {
            warn!("{}: STREAMOFF failed: {}", self.shared.path, e);
        }

        // STREAMOFF hands every buffer back without filling it.
        let cancelled: Vec<usize> = {
            let mut queued = lock(&self.shared.queued);
            let slots = queued
                .iter()
                .enumerate()
                .filter_map(|(slot, &q)| q.then_some(slot))
                .collect();
            queued.iter_mut().for_each(|q| *q = false);
            slots
        };
        for slot in cancelled {
            self.shared.dispatch(Completion::cancelled(slot));
        }
    }
}

impl CameraDevice for V4l2Camera {
    fn id(&self) -> &str {
        &self.shared.path
    }

    fn generate_configuration(&self, role: StreamRole) -> Result<StreamConfiguration> {
        let fmt = self.device.format()?;
        let format = PixelFormat::from_fourcc(fmt.fourcc.repr).unwrap_or(PixelFormat::Yuyv);
        Ok(StreamConfiguration {
            role,
            format,
            width: fmt.width,
            height: fmt.height,
            buffer_count: 4,
            frame_duration_limits: None,
        })
    }

    fn validate(&self, config: &mut StreamConfiguration) -> ValidationStatus {
        let (width, height, fourcc) = match self.try_format(config) {
            Ok(result) => result,
            Err(e) => {
                warn!("{}: TRY_FMT failed: {}", self.shared.path, e);
                return ValidationStatus::Invalid;
            }
        };
        let Some(format) = PixelFormat::from_fourcc(fourcc) else {
            return ValidationStatus::Invalid;
        };

        let mut status = ValidationStatus::Valid;
        if (width, height) != config.size() || format != config.format {
            config.width = width;
            config.height = height;
            config.format = format;
            status = ValidationStatus::Adjusted;
        }
        let count = config.buffer_count.clamp(MIN_BUFFERS, MAX_BUFFERS);
        if count != config.buffer_count {
            config.buffer_count = count;
            status = ValidationStatus::Adjusted;
        }
        status
    }

    #[instrument(skip(self))]
    fn configure(&self, config: &StreamConfiguration) -> Result<StreamId> {
        let mut state = lock(&self.state);
        if state.streaming {
            return Err(CaptureError::InvalidState("device is streaming".into()));
        }

        let requested = Format::new(config.width, config.height, FourCC::new(&config.format.fourcc()));
        let applied = self
            .device
            .set_format(&requested)
            .map_err(|e| ownership_error(&self.shared.path, e))?;
        if applied.width != config.width
            || applied.height != config.height
            || applied.fourcc != requested.fourcc
        {
            return Err(CaptureError::ConfigurationRejected(format!(
                "driver applied {}x{} {} instead of {}",
                applied.width, applied.height, applied.fourcc, config
            )));
        }

        if let Some(limits) = config.frame_duration_limits {
            let interval = Fraction::new(limits.min_us.min(u64::from(u32::MAX)) as u32, 1_000_000);
            match self.device.set_params(&Parameters::new(interval)) {
                Ok(params) => {
                    let applied_us = u64::from(params.interval.numerator) * 1_000_000
                        / u64::from(params.interval.denominator.max(1));
                    if applied_us < limits.min_us || applied_us > limits.max_us {
                        warn!(
                            "{}: driver frame interval {}us outside {}..{}us",
                            self.shared.path, applied_us, limits.min_us, limits.max_us
                        );
                    }
                }
                Err(e) => warn!("{}: frame interval not applied: {}", self.shared.path, e),
            }
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

        let granted = self
            .request_buffers(config.buffer_count)
            .map_err(|e| CaptureError::AllocationFailed(e.to_string()))?;
        if granted == 0 {
            return Err(CaptureError::AllocationFailed(
                "driver granted no buffers".into(),
            ));
        }

        let mut buffers = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            match self.export_plane(index) {
                Ok(plane) => buffers.push(FrameBuffer::new(index as usize, vec![plane])),
                Err(e) => {
                    drop(buffers);
                    if let Err(e) = self.request_buffers(0) {
                        warn!("{}: releasing partial allocation failed: {}", self.shared.path, e);
                    }
                    return Err(CaptureError::AllocationFailed(e.to_string()));
                }
            }
        }

        state.requests = vec![false; buffers.len()];
        *lock(&self.shared.queued) = vec![false; buffers.len()];
        Ok(buffers)
    }

    fn free(&self, stream: StreamId) -> Result<()> {
        let mut state = lock(&self.state);
        if state.streaming {
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
        lock(&self.shared.queued).clear();
        self.request_buffers(0)?;
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
        if state.streaming {
            return Err(CaptureError::InvalidState("device already streaming".into()));
        }
        if state.requests.is_empty() {
            return Err(CaptureError::AllocationFailed("no buffers allocated".into()));
        }

        // Plain V4L2 has no per-request controls; latch them for the whole run.
        self.apply_controls(controls);

        let mut kind = capture_type() as c_int;
        xioctl!(self.fd(), VIDIOC_STREAMON, &mut kind)?;
        state.streaming = true;
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("v4l2-dispatch".into())
            .spawn(move || shared.run())?;
        *lock(&self.dispatcher) = Some(handle);

        info!("{}: streaming started", self.shared.path);
        Ok(())
    }

    fn queue(&self, slot: usize, _controls: &FrameControls) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(CaptureError::QueueFailed {
                slot,
                reason: "device is not streaming".into(),
            });
        }

        match lock(&self.shared.queued).get_mut(slot) {
            Some(queued) => *queued = true,
            None => {
                return Err(CaptureError::QueueFailed {
                    slot,
                    reason: "no buffer for slot".into(),
                })
            }
        }

        let mut buf = v4l2_buffer {
            index: slot as u32,
            type_: capture_type(),
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        if let Err(e) = xioctl!(self.fd(), VIDIOC_QBUF, &mut buf) {
            if let Some(queued) = lock(&self.shared.queued).get_mut(slot) {
                *queued = false;
            }
            return Err(CaptureError::QueueFailed {
                slot,
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let was_streaming = mem::replace(&mut lock(&self.state).streaming, false);
        if was_streaming {
            self.halt();
            info!("{}: streaming stopped", self.shared.path);
        }
        Ok(())
    }

    fn release(&self) {
        let _ = self.stop();
        let mut state = lock(&self.state);
        if !state.released {
            state.released = true;
            lock(&self.held).remove(&self.shared.path);
            info!("Released {}", self.shared.path);
        }
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.release();
    }
}
