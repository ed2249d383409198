//! Tile-level change detection between consecutive frames.
//!
//! The screen is cut into `block_size × block_size` tiles and each tile is
//! compared byte-for-byte against the previous frame. The detector owns
//! the previous frame and replaces it after every call.

use std::cmp;

use crate::stream::types::RawScreenFrame;

/// Default tile edge in pixels.
pub const DEFAULT_BLOCK_SIZE: u32 = 64;

/// Above this share of changed tiles a full frame is cheaper.
const FULL_FRAME_RATIO: f64 = 0.80;

/// A changed screen region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Result of one detection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaFrame {
    pub width: u32,
    pub height: u32,
    /// Regions to encode. Empty means nothing changed.
    pub changed_blocks: Vec<Block>,
    /// The whole screen is covered by a single block.
    pub full_frame: bool,
}

impl DeltaFrame {
    fn full(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            changed_blocks: vec![Block {
                x: 0,
                y: 0,
                width,
                height,
            }],
            full_frame: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed_blocks.is_empty()
    }

    /// Fraction of the screen area that changed (0.0 – 1.0).
    pub fn change_ratio(&self) -> f64 {
        if self.full_frame {
            return 1.0;
        }
        let total = self.width as f64 * self.height as f64;
        if total == 0.0 {
            return 0.0;
        }
        let changed: f64 = self
            .changed_blocks
            .iter()
            .map(|b| b.width as f64 * b.height as f64)
            .sum();
        (changed / total).min(1.0)
    }
}

/// Stateful detector holding the previous frame of one session.
pub struct DeltaDetector {
    previous_frame: Option<RawScreenFrame>,
    block_size: u32,
}

impl DeltaDetector {
    /// A zero `block_size` falls back to [`DEFAULT_BLOCK_SIZE`].
    pub fn new(block_size: u32) -> Self {
        Self {
            previous_frame: None,
            block_size: if block_size == 0 {
                DEFAULT_BLOCK_SIZE
            } else {
                block_size
            },
        }
    }

    /// Forget the previous frame so the next one is encoded in full.
    pub fn reset(&mut self) {
        self.previous_frame = None;
    }

    pub fn has_previous(&self) -> bool {
        self.previous_frame.is_some()
    }

    /// Compare `current` with the stored previous frame, then store a copy
    /// of `current`.
    ///
    /// The result is a full frame when `force_full` is set, when there is
    /// no previous frame, or when the resolution changed.
    pub fn detect(&mut self, current: &RawScreenFrame, force_full: bool) -> DeltaFrame {
        let delta = match &self.previous_frame {
            Some(prev)
                if !force_full
                    && prev.width == current.width
                    && prev.height == current.height
                    && prev.stride == current.stride =>
            {
                self.detect_blocks(current, prev)
            }
            _ => DeltaFrame::full(current.width, current.height),
        };

        // Drop the old copy before taking the new one.
        self.previous_frame = None;
        self.previous_frame = Some(current.clone());
        delta
    }

    fn detect_blocks(&self, current: &RawScreenFrame, previous: &RawScreenFrame) -> DeltaFrame {
        let w = current.width as usize;
        let h = current.height as usize;
        let bs = self.block_size as usize;

        let blocks_x = w.div_ceil(bs);
        let blocks_y = h.div_ceil(bs);

        let mut changed = Vec::new();
        for by in 0..blocks_y {
            for bx in 0..blocks_x {
                let start_x = bx * bs;
                let start_y = by * bs;
                let end_x = cmp::min(start_x + bs, w);
                let end_y = cmp::min(start_y + bs, h);

                if block_differs(current, previous, start_x, start_y, end_x, end_y) {
                    changed.push(Block {
                        x: start_x as u32,
                        y: start_y as u32,
                        width: (end_x - start_x) as u32,
                        height: (end_y - start_y) as u32,
                    });
                }
            }
        }

        let total_blocks = blocks_x * blocks_y;
        if !changed.is_empty() && changed.len() as f64 / total_blocks as f64 > FULL_FRAME_RATIO {
            return DeltaFrame::full(current.width, current.height);
        }

        DeltaFrame {
            width: current.width,
            height: current.height,
            changed_blocks: changed,
            full_frame: false,
        }
    }
}

fn block_differs(
    current: &RawScreenFrame,
    previous: &RawScreenFrame,
    start_x: usize,
    start_y: usize,
    end_x: usize,
    end_y: usize,
) -> bool {
    let bpp = current.format.bytes_per_pixel();
    let stride = current.stride as usize;
    let left = start_x * bpp;
    let right = end_x * bpp;

    (start_y..end_y).any(|y| {
        let row = y * stride;
        current.data[row + left..row + right] != previous.data[row + left..row + right]
    })
}
