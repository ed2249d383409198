//! Software pointer compositing.
//!
//! Desktop duplication hands out the desktop image without the hardware
//! pointer; the pointer shape and position arrive separately and are drawn
//! onto the frame here when a session asks for the cursor.

use crate::stream::types::{PixelFormat, RawScreenFrame};

/// Pointer shape encodings, matching the desktop duplication shape types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    /// 1 bpp AND mask followed by a 1 bpp XOR mask of the same size.
    Monochrome,
    /// 32 bpp BGRA, alpha blended.
    Color,
    /// 32 bpp BGR; alpha 0 replaces the pixel, alpha 0xFF XORs it.
    MaskedColor,
}

#[derive(Debug, Clone)]
pub struct PointerShape {
    pub kind: PointerKind,
    pub width: u32,
    /// Height of the visible pointer. For [`PointerKind::Monochrome`] the
    /// buffer holds twice this many rows.
    pub height: u32,
    /// Bytes per buffer row.
    pub pitch: u32,
    pub data: Vec<u8>,
}

/// Draw `shape` with its top-left corner at (`x`, `y`) in frame pixels.
///
/// Parts outside the frame are clipped. Frames in a format other than
/// 32-bit BGRA/RGBA are left untouched.
pub fn composite(frame: &mut RawScreenFrame, shape: &PointerShape, x: i32, y: i32) {
    // Index of the blue and red channels inside a frame pixel.
    let (b, r) = match frame.format {
        PixelFormat::Bgra8 => (0, 2),
        PixelFormat::Rgba8 => (2, 0),
        _ => return,
    };
    let stride = frame.stride as usize;
    let pitch = shape.pitch as usize;

    for row in 0..shape.height {
        let fy = y + row as i32;
        if fy < 0 || fy >= frame.height as i32 {
            continue;
        }
        for col in 0..shape.width {
            let fx = x + col as i32;
            if fx < 0 || fx >= frame.width as i32 {
                continue;
            }
            let at = fy as usize * stride + fx as usize * 4;
            let Some(dst) = frame.data.get_mut(at..at + 4) else {
                continue;
            };
            let (row, col) = (row as usize, col as usize);

            match shape.kind {
                PointerKind::Monochrome => {
                    let bit = |plane_row: usize| {
                        shape
                            .data
                            .get(plane_row * pitch + col / 8)
                            .is_some_and(|byte| byte & (0x80 >> (col % 8)) != 0)
                    };
                    let and = bit(row);
                    let xor = bit(row + shape.height as usize);
                    for c in [b, 1, r] {
                        let mut v = if and { dst[c] } else { 0 };
                        if xor {
                            v ^= 0xFF;
                        }
                        dst[c] = v;
                    }
                }
                PointerKind::Color | PointerKind::MaskedColor => {
                    let src_at = row * pitch + col * 4;
                    let Some(src) = shape.data.get(src_at..src_at + 4) else {
                        continue;
                    };
                    let channels = [(b, src[0]), (1, src[1]), (r, src[2])];
                    match (shape.kind, src[3]) {
                        (PointerKind::MaskedColor, 0) => {
                            channels.iter().for_each(|&(c, s)| dst[c] = s);
                        }
                        (PointerKind::MaskedColor, _) => {
                            channels.iter().for_each(|&(c, s)| dst[c] ^= s);
                        }
                        (_, 0) => {}
                        (_, 255) => channels.iter().for_each(|&(c, s)| dst[c] = s),
                        (_, alpha) => {
                            let a = alpha as u16;
                            for &(c, s) in &channels {
                                dst[c] = ((s as u16 * a + dst[c] as u16 * (255 - a)) / 255) as u8;
                            }
                        }
                    }
                }
            }
        }
    }
}
