// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Frame buffers: the slot pool and the strategies that back its slots.
//!
//! ## Overview
//!
//! ```text
//!              acquire            lock + send           BufferRelease
//!  ┌──────┐  ───────────► ┌──────────┐ ──────────► ┌────────┐ ─────────┐
//!  │ free │               │ acquired │             │ locked │          │
//!  └──────┘ ◄─────────────└──────────┘             └────────┘          │
//!     ▲          release                                               │
//!     └──────────────────────────── complete ──────────────────────────┘
//! ```
//!
//! - [`BufferPool`] owns a fixed number of slots and counts the free ones.
//! - A [`BufferStrategy`] fills slots with storage: [`DumbAllocator`] over a
//!   [`DrmDevice`] or [`MemfdDevice`] allocates locally, [`ImportStrategy`]
//!   wraps upstream dma-bufs.
//! - [`SlotDescriptor`] is what the delivery channel sends: geometry, plane
//!   layout and duplicated descriptors.

mod drm;
mod dumb;
pub mod format;
mod import;
mod mapping;
mod memfd;
mod pool;
mod semaphore;
mod slot;
mod strategy;

pub use drm::DrmDevice;
pub use dumb::{DumbAllocator, DumbBuffer, DumbDevice};
pub use import::ImportStrategy;
pub use mapping::PlaneMapping;
pub use memfd::MemfdDevice;
pub use pool::{BufferPool, MappedPlane, ReleaseHandle};
pub use slot::{Plane, SlotDescriptor, SlotRef, SlotStorage};
pub use strategy::{
    BufferStrategy, ExternalBuffer, ExternalPlane, OwnedDmaBuf, OwnedDmaBufPlane,
};
