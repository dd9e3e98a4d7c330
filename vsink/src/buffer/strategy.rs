// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! The buffer strategy capability and upstream buffer abstraction.

use std::{
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    sync::Arc,
};

use super::{mapping::PlaneMapping, slot::SlotStorage};
use crate::{Error, Result};

/// Backend capability: produce plane-backed buffers for pool slots.
///
/// A strategy is selected when the pool is built and owns whatever device
/// handle it needs. Two families exist:
///
/// - *local* strategies ([`super::DumbAllocator`]) allocate storage for a
///   given geometry, keep it across frames and let the producer copy pixels
///   into it through [`BufferStrategy::map`];
/// - *import* strategies ([`super::ImportStrategy`]) wrap buffers supplied by
///   an upstream stage without copying.
///
/// Both yield the same [`SlotStorage`] shape so the pool and the delivery
/// channel never need to know which one is in use.
pub trait BufferStrategy: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// True for strategies that allocate storage themselves.
    fn is_local(&self) -> bool;

    /// Allocates storage for a `width`x`height` frame of `format`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] when any plane cannot be created;
    /// planes created before the failure are freed first.
    fn allocate(&mut self, width: u32, height: u32, format: u32) -> Result<SlotStorage>;

    /// Wraps an upstream buffer, holding a strong reference to it.
    fn import(&mut self, buffer: Arc<dyn ExternalBuffer>) -> Result<SlotStorage> {
        let _ = buffer;
        Err(Error::Unsupported("import"))
    }

    /// Maps one plane of `storage` for CPU writes.
    fn map(&self, storage: &SlotStorage, plane: usize) -> Result<PlaneMapping> {
        let _ = (storage, plane);
        Err(Error::Unsupported("map"))
    }

    /// Frees storage. Errors are logged by the implementation; freeing never
    /// fails from the caller's point of view.
    fn free(&mut self, storage: SlotStorage);
}

/// One plane of an upstream buffer.
#[derive(Debug, Clone, Copy)]
pub struct ExternalPlane<'a> {
    pub fd: BorrowedFd<'a>,
    pub offset: u32,
    pub stride: u32,
    pub size: u64,
}

/// A multi-plane dma-buf supplied by an upstream stage (e.g. a hardware
/// decoder's capture surface).
///
/// The upstream stage recycles the buffer once every `Arc` to it is gone, so
/// the pool holding a clone is what keeps it from being reused while the
/// consumer still displays it.
pub trait ExternalBuffer: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// DRM fourcc code.
    fn format(&self) -> u32;
    fn planes(&self) -> Vec<ExternalPlane<'_>>;
}

/// An [`ExternalBuffer`] that owns its plane descriptors.
#[derive(Debug)]
pub struct OwnedDmaBuf {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub planes: Vec<OwnedDmaBufPlane>,
}

#[derive(Debug)]
pub struct OwnedDmaBufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
    pub size: u64,
}

impl ExternalBuffer for OwnedDmaBuf {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> u32 {
        self.format
    }

    fn planes(&self) -> Vec<ExternalPlane<'_>> {
        self.planes
            .iter()
            .map(|p| ExternalPlane {
                fd: p.fd.as_fd(),
                offset: p.offset,
                stride: p.stride,
                size: p.size,
            })
            .collect()
    }
}
