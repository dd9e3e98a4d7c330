// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! DRM fourcc pixel formats and their plane geometry.

/// Builds a DRM fourcc code from its four characters.
pub const fn fourcc(a: char, b: char, c: char, d: char) -> u32 {
    u32::from_le_bytes([(a as u8), (b as u8), (c as u8), (d as u8)])
}

pub const DRM_FORMAT_NV12: u32 = fourcc('N', 'V', '1', '2');
pub const DRM_FORMAT_NV21: u32 = fourcc('N', 'V', '2', '1');
pub const DRM_FORMAT_XRGB8888: u32 = fourcc('X', 'R', '2', '4');
pub const DRM_FORMAT_ARGB8888: u32 = fourcc('A', 'R', '2', '4');

/// Size of one plane as requested from a dumb buffer allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneGeometry {
    /// Width in pixels of `bpp` bits.
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

impl PlaneGeometry {
    /// Bytes of payload in one row (without stride padding).
    pub fn row_bytes(&self) -> usize {
        (self.width as usize * self.bpp as usize).div_ceil(8)
    }
}

/// Plane layout of a frame of `format` with the given dimensions.
///
/// Semi-planar YUV formats use two planes: full resolution luma, and
/// interleaved chroma at half resolution in both directions. Returns `None`
/// for formats the local allocators do not handle.
pub fn plane_geometry(format: u32, width: u32, height: u32) -> Option<Vec<PlaneGeometry>> {
    match format {
        DRM_FORMAT_NV12 | DRM_FORMAT_NV21 => Some(vec![
            PlaneGeometry {
                width,
                height,
                bpp: 8,
            },
            PlaneGeometry {
                width: width.div_ceil(2),
                height: height.div_ceil(2),
                bpp: 16,
            },
        ]),
        DRM_FORMAT_XRGB8888 | DRM_FORMAT_ARGB8888 => Some(vec![PlaneGeometry {
            width,
            height,
            bpp: 32,
        }]),
        _ => None,
    }
}

/// Printable form of a fourcc code, for logs.
pub fn fourcc_name(format: u32) -> String {
    format
        .to_le_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
        .collect()
}
