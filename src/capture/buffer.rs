//! Hardware-backed frame buffers

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::capture::stream::StreamId;

/// One contiguous memory region of a frame buffer.
///
/// Several planes may share a file descriptor and differ only by offset.
#[derive(Debug)]
pub struct Plane {
    fd: Arc<OwnedFd>,
    offset: u64,
    length: usize,
    mapped: AtomicBool,
}

impl Plane {
    pub fn new(fd: Arc<OwnedFd>, offset: u64, length: usize) -> Self {
        Self {
            fd,
            offset,
            length,
            mapped: AtomicBool::new(false),
        }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    /// Marks the plane as mapped. Returns false if a mapping is already open.
    pub(crate) fn claim_mapping(&self) -> bool {
        self.mapped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_mapping(&self) {
        self.mapped.store(false, Ordering::Release);
    }
}

/// A buffer large enough to hold one frame, made of 1..N planes.
#[derive(Debug)]
pub struct FrameBuffer {
    index: usize,
    planes: Vec<Plane>,
}

impl FrameBuffer {
    pub fn new(index: usize, planes: Vec<Plane>) -> Self {
        Self { index, planes }
    }

    /// Slot index inside the pool; doubles as the request slot it is bound to.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }
}

/// Fixed set of buffers reserved for one stream.
///
/// Built once per session; its length never changes afterwards.
#[derive(Debug)]
pub struct BufferPool {
    stream: StreamId,
    buffers: Box<[FrameBuffer]>,
}

impl BufferPool {
    pub fn new(stream: StreamId, buffers: Vec<FrameBuffer>) -> Self {
        Self {
            stream,
            buffers: buffers.into_boxed_slice(),
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FrameBuffer> {
        self.buffers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameBuffer> {
        self.buffers.iter()
    }

    /// Planes with a mapping currently open; zero whenever no callback is running.
    pub fn mapped_planes(&self) -> usize {
        self.buffers
            .iter()
            .flat_map(|b| b.planes())
            .filter(|p| p.is_mapped())
            .count()
    }
}
