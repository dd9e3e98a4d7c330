// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Local allocation of plane-backed buffers through a dumb buffer device.

use std::os::fd::{AsFd, OwnedFd};

use tracing::{debug, error};

use super::{
    format::{fourcc_name, plane_geometry},
    mapping::PlaneMapping,
    slot::{Plane, SlotStorage},
    strategy::BufferStrategy,
};
use crate::{Error, Result};

/// A dumb buffer as returned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

/// Device operations needed to back slots with dumb buffers.
///
/// Implemented for DRM nodes by [`super::DrmDevice`] and for the software
/// path by [`super::MemfdDevice`].
pub trait DumbDevice: Send {
    /// Creates a buffer of `height` rows of `width` pixels at `bpp` bits.
    fn create(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer>;

    /// Returns the offset at which the buffer can be mapped.
    fn map_offset(&mut self, handle: u32) -> Result<u64>;

    /// Exports the buffer as a shareable dma-buf descriptor.
    fn export(&mut self, handle: u32) -> Result<OwnedFd>;

    /// Destroys the buffer handle. Exported descriptors stay valid.
    fn destroy(&mut self, handle: u32) -> Result<()>;

    /// Maps a plane for CPU access. The default maps the exported
    /// descriptor, which dma-buf exporters support.
    fn map(&self, plane: &Plane) -> Result<PlaneMapping> {
        PlaneMapping::new(plane.fd.as_fd(), 0, plane.size as usize)
    }
}

/// Local [`BufferStrategy`]: every slot plane is a dumb buffer created on a
/// device node.
#[derive(Debug)]
pub struct DumbAllocator<D: DumbDevice> {
    device: D,
}

impl<D: DumbDevice> DumbAllocator<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Creates, maps and exports one plane.
    fn create_plane(&mut self, width: u32, height: u32, bpp: u32) -> Result<Plane> {
        let buffer = self.device.create(width, height, bpp)?;
        let exported = self
            .device
            .map_offset(buffer.handle)
            .and_then(|map_offset| Ok((map_offset, self.device.export(buffer.handle)?)));
        match exported {
            Ok((map_offset, fd)) => Ok(Plane {
                handle: buffer.handle,
                fd,
                size: buffer.size,
                stride: buffer.pitch,
                offset: 0,
                map_offset,
            }),
            Err(err) => {
                self.destroy_handle(buffer.handle);
                Err(err)
            }
        }
    }

    fn destroy_handle(&mut self, handle: u32) {
        if let Err(err) = self.device.destroy(handle) {
            error!("Failed to destroy dumb buffer {}: {}", handle, err);
        }
    }

    fn free_planes(&mut self, planes: Vec<Plane>) {
        for plane in planes {
            self.destroy_handle(plane.handle);
            // plane.fd closes here
        }
    }
}

impl<D: DumbDevice> BufferStrategy for DumbAllocator<D> {
    fn name(&self) -> &'static str {
        "dumb"
    }

    fn is_local(&self) -> bool {
        true
    }

    fn allocate(&mut self, width: u32, height: u32, format: u32) -> Result<SlotStorage> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArg(format!("empty frame {width}x{height}")));
        }
        let geometry = plane_geometry(format, width, height).ok_or_else(|| {
            Error::InvalidArg(format!("unsupported format {}", fourcc_name(format)))
        })?;

        let mut planes = Vec::with_capacity(geometry.len());
        for (index, plane) in geometry.iter().enumerate() {
            match self.create_plane(plane.width, plane.height, plane.bpp) {
                Ok(plane) => planes.push(plane),
                Err(err) => {
                    // never leave earlier planes behind
                    self.free_planes(planes);
                    return Err(Error::AllocationFailed {
                        width,
                        height,
                        plane: index,
                        reason: err.to_string(),
                    });
                }
            }
        }

        debug!(
            "Allocated {}x{} {} with {} plane(s)",
            width,
            height,
            fourcc_name(format),
            planes.len()
        );
        Ok(SlotStorage {
            width,
            height,
            format,
            planes,
            upstream: None,
        })
    }

    fn map(&self, storage: &SlotStorage, plane: usize) -> Result<PlaneMapping> {
        let plane = storage
            .planes
            .get(plane)
            .ok_or_else(|| Error::InvalidArg(format!("no plane {plane}")))?;
        self.device.map(plane)
    }

    fn free(&mut self, storage: SlotStorage) {
        self.free_planes(storage.planes);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::buffer::{MemfdDevice, format::DRM_FORMAT_NV12};

    /// Memfd device that fails the n-th `create` call and tracks live handles.
    pub(crate) struct FlakyDevice {
        inner: MemfdDevice,
        creates: usize,
        fail_on_create: Option<usize>,
        live: Arc<Mutex<HashSet<u32>>>,
    }

    impl FlakyDevice {
        pub(crate) fn new(fail_on_create: Option<usize>) -> (Self, Arc<Mutex<HashSet<u32>>>) {
            let live = Arc::new(Mutex::new(HashSet::new()));
            (
                Self {
                    inner: MemfdDevice::new(),
                    creates: 0,
                    fail_on_create,
                    live: live.clone(),
                },
                live,
            )
        }
    }

    impl DumbDevice for FlakyDevice {
        fn create(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer> {
            let call = self.creates;
            self.creates += 1;
            if self.fail_on_create == Some(call) {
                return Err(Error::Errno(nix::errno::Errno::ENOMEM));
            }
            let buffer = self.inner.create(width, height, bpp)?;
            self.live.lock().unwrap().insert(buffer.handle);
            Ok(buffer)
        }

        fn map_offset(&mut self, handle: u32) -> Result<u64> {
            self.inner.map_offset(handle)
        }

        fn export(&mut self, handle: u32) -> Result<OwnedFd> {
            self.inner.export(handle)
        }

        fn destroy(&mut self, handle: u32) -> Result<()> {
            self.live.lock().unwrap().remove(&handle);
            self.inner.destroy(handle)
        }
    }

    #[test]
    fn second_plane_failure_frees_the_first() {
        let (device, live) = FlakyDevice::new(Some(1));
        let mut allocator = DumbAllocator::new(device);

        let err = allocator.allocate(64, 32, DRM_FORMAT_NV12).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed { plane: 1, .. }));
        assert!(live.lock().unwrap().is_empty());
        assert_eq!(allocator.device().inner.live_buffers(), 0);
    }

    #[test]
    fn nv12_allocation_has_two_planes() {
        let (device, live) = FlakyDevice::new(None);
        let mut allocator = DumbAllocator::new(device);

        let storage = allocator.allocate(64, 32, DRM_FORMAT_NV12).unwrap();
        assert_eq!(storage.planes.len(), 2);
        assert!(storage.planes[0].stride >= 64);
        assert_eq!(live.lock().unwrap().len(), 2);

        let mut mapping = allocator.map(&storage, 1).unwrap();
        mapping.as_mut_slice()[0] = 0x80;

        allocator.free(storage);
        assert!(live.lock().unwrap().is_empty());
    }

    #[test]
    fn unsupported_format_is_rejected() {
        let (device, _live) = FlakyDevice::new(None);
        let mut allocator = DumbAllocator::new(device);
        assert!(matches!(
            allocator.allocate(64, 32, 0x1234_5678),
            Err(Error::InvalidArg(_))
        ));
    }
}
