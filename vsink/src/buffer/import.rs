// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Zero-copy strategy wrapping upstream dma-bufs.

use std::sync::Arc;

use tracing::trace;

use super::{
    format::fourcc_name,
    slot::{Plane, SlotStorage},
    strategy::{BufferStrategy, ExternalBuffer},
};
use crate::{Error, Result};

/// [`BufferStrategy`] for frames that already live in dma-bufs.
///
/// Imported storage duplicates the upstream descriptors and keeps the
/// upstream buffer alive until the slot is released.
#[derive(Debug, Default)]
pub struct ImportStrategy;

impl ImportStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl BufferStrategy for ImportStrategy {
    fn name(&self) -> &'static str {
        "import"
    }

    fn is_local(&self) -> bool {
        false
    }

    fn allocate(&mut self, width: u32, height: u32, format: u32) -> Result<SlotStorage> {
        trace!(
            "Import strategy asked to allocate {}x{} {}",
            width,
            height,
            fourcc_name(format)
        );
        Err(Error::Unsupported("allocation on an import-only pool"))
    }

    fn import(&mut self, buffer: Arc<dyn ExternalBuffer>) -> Result<SlotStorage> {
        let external = buffer.planes();
        if external.is_empty() || external.len() > vsink_proto::MAX_PLANES {
            return Err(Error::InvalidArg(format!(
                "upstream buffer has {} planes",
                external.len()
            )));
        }
        let planes = external
            .iter()
            .map(|plane| {
                Ok(Plane {
                    handle: 0,
                    fd: plane.fd.try_clone_to_owned()?,
                    size: plane.size,
                    stride: plane.stride,
                    offset: plane.offset,
                    map_offset: u64::from(plane.offset),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        drop(external);

        Ok(SlotStorage {
            width: buffer.width(),
            height: buffer.height(),
            format: buffer.format(),
            planes,
            upstream: Some(buffer),
        })
    }

    fn free(&mut self, storage: SlotStorage) {
        // duplicated fds close and the upstream reference drops here
        drop(storage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{
        DumbDevice, MemfdDevice,
        format::DRM_FORMAT_XRGB8888,
        strategy::{OwnedDmaBuf, OwnedDmaBufPlane},
    };

    fn upstream() -> Arc<OwnedDmaBuf> {
        let mut device = MemfdDevice::new();
        let buffer = device.create(8, 8, 32).unwrap();
        Arc::new(OwnedDmaBuf {
            width: 8,
            height: 8,
            format: DRM_FORMAT_XRGB8888,
            planes: vec![OwnedDmaBufPlane {
                fd: device.export(buffer.handle).unwrap(),
                offset: 0,
                stride: buffer.pitch,
                size: buffer.size,
            }],
        })
    }

    #[test]
    fn import_holds_upstream_until_freed() {
        let buffer = upstream();
        let mut strategy = ImportStrategy::new();

        let storage = strategy.import(buffer.clone()).unwrap();
        assert!(storage.is_imported());
        assert_eq!(storage.planes.len(), 1);
        assert_eq!(Arc::strong_count(&buffer), 2);

        strategy.free(storage);
        assert_eq!(Arc::strong_count(&buffer), 1);
    }

    #[test]
    fn allocation_is_unsupported() {
        let mut strategy = ImportStrategy::new();
        assert!(matches!(
            strategy.allocate(8, 8, DRM_FORMAT_XRGB8888),
            Err(Error::Unsupported(_))
        ));
    }
}
