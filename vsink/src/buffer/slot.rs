// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Buffer slots and the plane-backed storage they hold.

use std::{
    os::fd::OwnedFd,
    sync::Arc,
};

use vsink_proto::{MAX_PLANES, PlaneLayout};

use super::strategy::ExternalBuffer;
use crate::Result;

/// One memory plane of a slot's buffer.
#[derive(Debug)]
pub struct Plane {
    /// Device-local handle (GEM handle for DRM dumb buffers, 0 for imports).
    pub handle: u32,
    /// Shareable dma-buf descriptor; duplicated for every send.
    pub fd: OwnedFd,
    /// Size of the backing buffer in bytes.
    pub size: u64,
    /// Row stride in bytes.
    pub stride: u32,
    /// Byte offset of the plane inside the dma-buf.
    pub offset: u32,
    /// Offset to pass to `mmap` on the allocating device.
    pub map_offset: u64,
}

/// Plane-backed storage of a slot, as produced by a
/// [`super::BufferStrategy`].
///
/// Local storage is kept across frames and reused; imported storage holds a
/// strong reference to the upstream buffer and is dropped on release.
pub struct SlotStorage {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc code.
    pub format: u32,
    pub planes: Vec<Plane>,
    /// Upstream buffer kept alive while the slot is in flight.
    pub upstream: Option<Arc<dyn ExternalBuffer>>,
}

impl SlotStorage {
    pub fn is_imported(&self) -> bool {
        self.upstream.is_some()
    }

    pub(crate) fn matches(&self, width: u32, height: u32, format: u32) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

impl std::fmt::Debug for SlotStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotStorage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &super::format::fourcc_name(self.format))
            .field("planes", &self.planes)
            .field("imported", &self.is_imported())
            .finish()
    }
}

/// Handle to a slot returned by [`super::BufferPool::acquire`].
///
/// The handle is a plain index; the slot goes back to the pool through
/// [`super::BufferPool::release`] or [`super::BufferPool::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub index: usize,
    /// Identifier used for this slot on the wire.
    pub buffer_id: u32,
}

/// One entry of the pool.
#[derive(Debug)]
pub(crate) struct BufferSlot {
    pub(crate) index: usize,
    pub(crate) buffer_id: u32,
    pub(crate) storage: Option<SlotStorage>,
    /// Handed out by `acquire` and not yet released.
    pub(crate) acquired: bool,
    pub(crate) locked: bool,
    pub(crate) lock_count: u32,
}

impl BufferSlot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            buffer_id: index as u32,
            storage: None,
            acquired: false,
            locked: false,
            lock_count: 0,
        }
    }

    pub(crate) fn slot_ref(&self) -> SlotRef {
        SlotRef {
            index: self.index,
            buffer_id: self.buffer_id,
        }
    }
}

/// Everything needed to send one slot to the consumer, detached from the
/// pool lock.
///
/// The descriptors are duplicates: the slot keeps its own copies and the
/// duplicates close when the descriptor is dropped after sending.
#[derive(Debug)]
pub struct SlotDescriptor {
    pub slot: SlotRef,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub planes: [PlaneLayout; MAX_PLANES],
    pub fds: Vec<OwnedFd>,
}

impl SlotDescriptor {
    pub(crate) fn from_storage(slot: SlotRef, storage: &SlotStorage) -> Result<Self> {
        let mut planes = [PlaneLayout::default(); MAX_PLANES];
        let mut fds = Vec::with_capacity(storage.planes.len());
        for (layout, plane) in planes.iter_mut().zip(&storage.planes) {
            layout.offset = plane.offset;
            layout.stride = plane.stride;
            fds.push(plane.fd.try_clone()?);
        }
        Ok(Self {
            slot,
            width: storage.width,
            height: storage.height,
            format: storage.format,
            planes,
            fds,
        })
    }
}
