// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! DRM dumb buffer device.

use std::{
    ffi::c_void,
    fs::OpenOptions,
    os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd},
    path::{Path, PathBuf},
};

use nix::errno::Errno;
use tracing::{debug, trace};

use super::{
    dumb::{DumbBuffer, DumbDevice},
    mapping::PlaneMapping,
    slot::Plane,
};
use crate::{Error, Result};

/* Definitions from drm.h and drm_mode.h */
const fn drm_iowr<T>(code: u8) -> u32 {
    let typ = 'd' as u32;
    let size = std::mem::size_of::<T>() as u32;
    let dir = 0x1 | 0x2;
    (code as u32) | (typ << 8) | (size << 16) | (dir << 30)
}

const DRM_IOCTL_PRIME_HANDLE_TO_FD: u32 = drm_iowr::<DrmPrimeHandle>(0x2D);
const DRM_IOCTL_MODE_CREATE_DUMB: u32 = drm_iowr::<DrmModeCreateDumb>(0xB2);
const DRM_IOCTL_MODE_MAP_DUMB: u32 = drm_iowr::<DrmModeMapDumb>(0xB3);
const DRM_IOCTL_MODE_DESTROY_DUMB: u32 = drm_iowr::<DrmModeDestroyDumb>(0xB4);

#[repr(C)]
#[derive(Default)]
struct DrmModeCreateDumb {
    height: u32,
    width: u32,
    bpp: u32,
    flags: u32,
    handle: u32,
    pitch: u32,
    size: u64,
}

#[repr(C)]
#[derive(Default)]
struct DrmModeMapDumb {
    handle: u32,
    pad: u32,
    offset: u64,
}

#[repr(C)]
struct DrmModeDestroyDumb {
    handle: u32,
}

#[repr(C)]
struct DrmPrimeHandle {
    handle: u32,
    flags: u32,
    fd: i32,
}

/* Requirements: arg must be properly aligned, have the type the ioctl
 * expects, and outlive the call */
unsafe fn ioctl_loop(fd: &OwnedFd, code: u32, arg: *mut c_void) -> std::result::Result<(), Errno> {
    let req = code as libc::c_ulong;
    loop {
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), req, arg) };
        if ret == 0 {
            return Ok(());
        }
        match Errno::last() {
            Errno::EINTR | Errno::EAGAIN => continue,
            errno => {
                trace!("ioctl {:x} failed: {}", code, errno);
                return Err(errno);
            }
        }
    }
}

/// A DRM device node used to create dumb buffers.
///
/// Dumb buffers are linear, CPU-mappable and exportable as dma-bufs via
/// PRIME, which is all the consumer needs to scan them out or texture from
/// them.
#[derive(Debug)]
pub struct DrmDevice {
    fd: OwnedFd,
    path: PathBuf,
}

impl DrmDevice {
    /// Opens the device node at `path` read/write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the node cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        debug!("Opened DRM device {}", path.display());
        Ok(Self {
            fd: file.into(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DumbDevice for DrmDevice {
    fn create(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer> {
        let mut arg = DrmModeCreateDumb {
            height,
            width,
            bpp,
            ..Default::default()
        };
        unsafe {
            // Safety: arg is repr(C) and matches drm_mode_create_dumb
            ioctl_loop(
                &self.fd,
                DRM_IOCTL_MODE_CREATE_DUMB,
                &mut arg as *mut _ as *mut c_void,
            )?;
        }
        Ok(DumbBuffer {
            handle: arg.handle,
            pitch: arg.pitch,
            size: arg.size,
        })
    }

    fn map_offset(&mut self, handle: u32) -> Result<u64> {
        let mut arg = DrmModeMapDumb {
            handle,
            ..Default::default()
        };
        unsafe {
            // Safety: arg is repr(C) and matches drm_mode_map_dumb
            ioctl_loop(
                &self.fd,
                DRM_IOCTL_MODE_MAP_DUMB,
                &mut arg as *mut _ as *mut c_void,
            )?;
        }
        Ok(arg.offset)
    }

    fn export(&mut self, handle: u32) -> Result<OwnedFd> {
        let mut arg = DrmPrimeHandle {
            handle,
            flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            fd: -1,
        };
        unsafe {
            // Safety: arg is repr(C) and matches drm_prime_handle
            ioctl_loop(
                &self.fd,
                DRM_IOCTL_PRIME_HANDLE_TO_FD,
                &mut arg as *mut _ as *mut c_void,
            )?;
        }
        if arg.fd < 0 {
            return Err(Error::Other(format!(
                "PRIME export of handle {handle} returned no descriptor"
            )));
        }
        Ok(unsafe {
            // Safety: the kernel just created this descriptor for us
            OwnedFd::from_raw_fd(arg.fd)
        })
    }

    fn destroy(&mut self, handle: u32) -> Result<()> {
        let mut arg = DrmModeDestroyDumb { handle };
        unsafe {
            // Safety: arg is repr(C) and matches drm_mode_destroy_dumb
            ioctl_loop(
                &self.fd,
                DRM_IOCTL_MODE_DESTROY_DUMB,
                &mut arg as *mut _ as *mut c_void,
            )?;
        }
        Ok(())
    }

    /// Maps through the device node at the offset from `MAP_DUMB`, which
    /// works on drivers that do not support mapping exported dma-bufs.
    fn map(&self, plane: &Plane) -> Result<PlaneMapping> {
        PlaneMapping::new(self.fd.as_fd(), plane.map_offset, plane.size as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers_match_kernel_headers() {
        assert_eq!(DRM_IOCTL_MODE_CREATE_DUMB, 0xC020_64B2);
        assert_eq!(DRM_IOCTL_MODE_MAP_DUMB, 0xC010_64B3);
        assert_eq!(DRM_IOCTL_MODE_DESTROY_DUMB, 0xC004_64B4);
        assert_eq!(DRM_IOCTL_PRIME_HANDLE_TO_FD, 0xC00C_642D);
    }

    #[test]
    fn missing_node_fails_to_open() {
        let err = DrmDevice::open("/nonexistent/dri/card9").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
