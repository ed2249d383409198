//! Frame and display types shared by the capture pipeline stages.
//!
//! These are in-memory representations. The serialized form that leaves
//! the process is [`crate::stream::wire::EncodedFrame`].

use std::time::Instant;

use serde::Serialize;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Blue, Green, Red, Alpha (DXGI default).
    Bgra8,
    /// Red, Green, Blue, Alpha.
    Rgba8,
    /// Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }

    /// Convert one pixel to RGB.
    fn rgb(self, px: &[u8]) -> [u8; 3] {
        match self {
            PixelFormat::Bgra8 => [px[2], px[1], px[0]],
            PixelFormat::Rgba8 | PixelFormat::Rgb8 => [px[0], px[1], px[2]],
        }
    }
}

// ── RawScreenFrame ───────────────────────────────────────────────

/// An uncompressed screen capture.
///
/// `data` holds `height` rows of `stride` bytes. `stride` may exceed
/// `width * bpp` because GPUs pad rows.
#[derive(Debug, Clone)]
pub struct RawScreenFrame {
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    pub timestamp: Instant,
}

impl RawScreenFrame {
    /// Build a tightly packed frame (`stride == width * bpp`).
    pub fn packed(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            stride: width * format.bytes_per_pixel() as u32,
            format,
            data,
            timestamp: Instant::now(),
        }
    }

    /// `true` when the buffer holds at least `stride * height` bytes.
    pub fn is_consistent(&self) -> bool {
        let row = self.width as usize * self.format.bytes_per_pixel();
        self.stride as usize >= row && self.data.len() >= self.stride as usize * self.height as usize
    }

    /// Copy a rectangle out as tightly packed rows in the native format.
    pub fn region(&self, x: u32, y: u32, width: u32, height: u32) -> Vec<u8> {
        let bpp = self.format.bytes_per_pixel();
        let row_bytes = width as usize * bpp;
        let mut out = Vec::with_capacity(row_bytes * height as usize);
        for row in y..y + height {
            let offset = row as usize * self.stride as usize + x as usize * bpp;
            out.extend_from_slice(&self.data[offset..offset + row_bytes]);
        }
        out
    }

    /// Like [`region`](Self::region) but converted to packed RGB.
    pub fn region_rgb(&self, x: u32, y: u32, width: u32, height: u32) -> Vec<u8> {
        let bpp = self.format.bytes_per_pixel();
        let mut out = Vec::with_capacity(width as usize * height as usize * 3);
        for row in y..y + height {
            let start = row as usize * self.stride as usize + x as usize * bpp;
            let line = &self.data[start..start + width as usize * bpp];
            for px in line.chunks_exact(bpp) {
                out.extend_from_slice(&self.format.rgb(px));
            }
        }
        out
    }
}

// ── DisplayInfo ──────────────────────────────────────────────────

/// A capturable display as reported by `stream_displays`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    pub id: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub is_primary: bool,
    /// Inferred from graphical-session evidence rather than enumerated.
    pub synthetic: bool,
}
