// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! RAII memory mapping of one buffer plane.

use std::{
    ffi::c_void,
    num::NonZeroUsize,
    os::fd::AsFd,
    ptr::NonNull,
};

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use tracing::error;

use crate::{Error, Result};

/// A shared read/write mapping of a plane, unmapped on drop.
///
/// Used by the producer to copy pixel rows into locally allocated buffers.
/// The mapping does not own the underlying buffer; it must be dropped before
/// the buffer is freed, which the pool guarantees by only handing mappings
/// out for the duration of a fill closure.
pub struct PlaneMapping {
    ptr: NonNull<c_void>,
    len: usize,
}

// Safety: the mapping is plain shared memory with no thread affinity.
unsafe impl Send for PlaneMapping {}

impl PlaneMapping {
    /// Maps `len` bytes of `fd` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArg`] for a zero length and [`Error::Errno`]
    /// when `mmap` fails.
    pub fn new<F: AsFd>(fd: F, offset: u64, len: usize) -> Result<Self> {
        let length =
            NonZeroUsize::new(len).ok_or_else(|| Error::InvalidArg("empty plane mapping".into()))?;
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| Error::InvalidArg(format!("mmap offset {offset} out of range")))?;
        let ptr = unsafe {
            // Safety: a fresh shared mapping chosen by the kernel does not
            // alias any Rust-managed memory.
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset,
            )?
        };
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) }
    }
}

impl Drop for PlaneMapping {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            error!("Failed to unmap plane: {:?}", err);
        }
    }
}

impl std::fmt::Debug for PlaneMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaneMapping")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
