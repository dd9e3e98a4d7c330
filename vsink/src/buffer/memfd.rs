// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Software dumb buffer device backed by anonymous shared memory.

use std::{
    collections::HashMap,
    os::fd::{AsFd, OwnedFd},
};

use nix::{
    sys::memfd::{MemFdCreateFlag, memfd_create},
    unistd::ftruncate,
};

use super::dumb::{DumbBuffer, DumbDevice};
use crate::{Error, Result};

const PITCH_ALIGN: u32 = 64;

/// [`DumbDevice`] that allocates each buffer as a sealed-size memfd.
///
/// Used when no DRM node is available; consumers on the same host can map
/// the descriptors just like dma-bufs.
#[derive(Debug, Default)]
pub struct MemfdDevice {
    next_handle: u32,
    buffers: HashMap<u32, OwnedFd>,
}

impl MemfdDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers created and not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }
}

impl DumbDevice for MemfdDevice {
    fn create(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer> {
        let row = (u64::from(width) * u64::from(bpp)).div_ceil(8);
        let pitch = u32::try_from(row)
            .ok()
            .and_then(|row| row.checked_next_multiple_of(PITCH_ALIGN))
            .ok_or_else(|| Error::InvalidArg(format!("row of {width} pixels too wide")))?;
        let size = u64::from(pitch) * u64::from(height);
        let len = libc::off_t::try_from(size)
            .map_err(|_| Error::InvalidArg(format!("buffer of {size} bytes too large")))?;

        let fd = memfd_create(c"vsink-buffer", MemFdCreateFlag::MFD_CLOEXEC)?;
        ftruncate(&fd, len)?;

        self.next_handle += 1;
        let handle = self.next_handle;
        self.buffers.insert(handle, fd);
        Ok(DumbBuffer {
            handle,
            pitch,
            size,
        })
    }

    fn map_offset(&mut self, handle: u32) -> Result<u64> {
        self.buffers
            .contains_key(&handle)
            .then_some(0)
            .ok_or_else(|| Error::InvalidArg(format!("unknown buffer handle {handle}")))
    }

    fn export(&mut self, handle: u32) -> Result<OwnedFd> {
        let fd = self
            .buffers
            .get(&handle)
            .ok_or_else(|| Error::InvalidArg(format!("unknown buffer handle {handle}")))?;
        Ok(fd.as_fd().try_clone_to_owned()?)
    }

    fn destroy(&mut self, handle: u32) -> Result<()> {
        self.buffers
            .remove(&handle)
            .map(drop)
            .ok_or_else(|| Error::InvalidArg(format!("unknown buffer handle {handle}")))
    }
}
