//! Scoped read-only mappings of plane memory
//!
//! A [`PlaneMapping`] is the only way the core touches frame bytes. Mapping
//! is shared and read-only, so the slice handed to a sink aliases the
//! hardware buffer directly: nothing is copied. The mapping is released when
//! the guard is dropped, which bounds its lifetime to the completion callback
//! that created it, error and unwind paths included.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use tracing::warn;

use crate::capture::buffer::Plane;
use crate::error::{CaptureError, Result};

/// Live read-only mapping of one plane.
pub struct PlaneMapping<'a> {
    plane: &'a Plane,
    addr: Option<NonNull<c_void>>,
    map_len: usize,
    data_offset: usize,
}

impl<'a> PlaneMapping<'a> {
    /// Map `plane` (plane `plane_index` of buffer `buffer_index`) into memory.
    ///
    /// Fails with `MapFailed` if the plane already has an open mapping or the
    /// kernel refuses the mapping.
    pub fn map(buffer_index: usize, plane_index: usize, plane: &'a Plane) -> Result<Self> {
        let map_failed = |source| CaptureError::MapFailed {
            buffer: buffer_index,
            plane: plane_index,
            source,
        };

        if !plane.claim_mapping() {
            return Err(map_failed(Errno::EBUSY));
        }

        // mmap offsets must be page aligned; plane offsets need not be.
        let page = page_size::get() as u64;
        let aligned_offset = plane.offset() - plane.offset() % page;
        let data_offset = (plane.offset() - aligned_offset) as usize;
        let map_len = plane.length() + data_offset;

        let result = NonZeroUsize::new(map_len)
            .ok_or(Errno::EINVAL)
            .and_then(|len| {
                let offset = libc::off_t::try_from(aligned_offset).map_err(|_| Errno::EOVERFLOW)?;
                // SAFETY: a fresh shared read-only mapping; no existing memory is aliased.
                unsafe {
                    mman::mmap(
                        None,
                        len,
                        ProtFlags::PROT_READ,
                        MapFlags::MAP_SHARED,
                        plane.fd(),
                        offset,
                    )
                }
            });

        match result {
            Ok(addr) => Ok(Self {
                plane,
                addr: Some(addr),
                map_len,
                data_offset,
            }),
            Err(errno) => {
                plane.release_mapping();
                Err(map_failed(errno))
            }
        }
    }

    /// Plane bytes, `plane.length()` long.
    pub fn data(&self) -> &[u8] {
        match self.addr {
            // SAFETY: the region stays mapped for as long as `self` lives and
            // `data_offset + length == map_len`.
            Some(addr) => unsafe {
                std::slice::from_raw_parts(
                    addr.as_ptr().cast::<u8>().add(self.data_offset),
                    self.plane.length(),
                )
            },
            None => &[],
        }
    }

    /// First `bytes_used` bytes of the plane, clamped to the plane length.
    pub fn used(&self, bytes_used: u32) -> &[u8] {
        let data = self.data();
        let len = (bytes_used as usize).min(data.len());
        &data[..len]
    }

    /// Release the mapping now and report the result.
    pub fn unmap(mut self) -> nix::Result<()> {
        self.release()
    }

    fn release(&mut self) -> nix::Result<()> {
        let Some(addr) = self.addr.take() else {
            return Ok(());
        };
        // SAFETY: `addr`/`map_len` came from the successful mmap above and the
        // returned slices cannot outlive `self`.
        let result = unsafe { mman::munmap(addr, self.map_len) };
        self.plane.release_mapping();
        result
    }
}

impl Drop for PlaneMapping<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to unmap plane ({} bytes): {}", self.map_len, e);
        }
    }
}
