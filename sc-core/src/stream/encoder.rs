//! Per-session rectangle encoder.
//!
//! Each changed block becomes one [`FrameRect`]:
//!
//! - **lossy** (`use_lossy` and quality below 100): JPEG of the block;
//! - **lossless**: zstd of the packed pixels, or the raw pixels when
//!   compression does not shrink them.
//!
//! Settings can be changed between frames without recreating the encoder.

use std::io::Cursor;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;

use crate::error::ScError;
use crate::stream::delta::{Block, DeltaFrame};
use crate::stream::types::RawScreenFrame;
use crate::stream::wire::{EncodedFrame, EncodingTag, FrameRect, RectFlags};

/// Knobs the encoder reads on every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    /// 0–100; 100 is lossless.
    pub quality: u8,
    pub use_lossy: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            quality: 80,
            use_lossy: true,
        }
    }
}

/// Snapshot of encoder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncoderStats {
    /// Raw bytes in / encoded bytes out.
    pub compression_ratio: f64,
    pub average_encode_ms: f64,
}

pub struct FrameEncoder {
    settings: EncoderSettings,
    zstd_level: i32,
    frames: u64,
    raw_bytes: u64,
    encoded_bytes: u64,
    encode_time: Duration,
}

impl FrameEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        let mut encoder = Self {
            settings,
            zstd_level: 1,
            frames: 0,
            raw_bytes: 0,
            encoded_bytes: 0,
            encode_time: Duration::ZERO,
        };
        encoder.reconfigure(settings);
        encoder
    }

    /// Apply new settings in place.
    pub fn reconfigure(&mut self, settings: EncoderSettings) {
        self.settings = EncoderSettings {
            quality: settings.quality.min(100),
            ..settings
        };
        self.zstd_level = zstd_level_for(self.settings.quality);
    }

    pub fn settings(&self) -> EncoderSettings {
        self.settings
    }

    fn lossy(&self) -> bool {
        self.settings.use_lossy && self.settings.quality < 100
    }

    /// Encode every changed block of `delta` from `source`.
    ///
    /// An empty delta yields a frame without rectangles, which callers
    /// must not emit.
    pub fn encode(
        &mut self,
        delta: &DeltaFrame,
        source: &RawScreenFrame,
        sequence: u32,
        timestamp_ms: u32,
    ) -> Result<EncodedFrame, ScError> {
        let started = Instant::now();
        let flags = if delta.full_frame {
            RectFlags::KEYFRAME
        } else {
            RectFlags::empty()
        };

        let mut rects = Vec::with_capacity(delta.changed_blocks.len());
        for block in &delta.changed_blocks {
            rects.push(self.encode_block(block, source, flags)?);
        }

        if !rects.is_empty() {
            self.frames += 1;
            self.encode_time += started.elapsed();
        }

        Ok(EncodedFrame {
            sequence,
            timestamp_ms,
            rects,
        })
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            compression_ratio: if self.encoded_bytes == 0 {
                0.0
            } else {
                self.raw_bytes as f64 / self.encoded_bytes as f64
            },
            average_encode_ms: if self.frames == 0 {
                0.0
            } else {
                self.encode_time.as_secs_f64() * 1000.0 / self.frames as f64
            },
        }
    }

    fn encode_block(
        &mut self,
        block: &Block,
        source: &RawScreenFrame,
        flags: RectFlags,
    ) -> Result<FrameRect, ScError> {
        let fits = |v: u32| u16::try_from(v).map_err(|_| ScError::Encoding(format!("{v} exceeds u16")));
        let (x, y, width, height) = (fits(block.x)?, fits(block.y)?, fits(block.width)?, fits(block.height)?);

        let raw_len = block.width as u64 * block.height as u64 * source.format.bytes_per_pixel() as u64;
        let (encoding, payload) = if self.lossy() {
            let rgb = source.region_rgb(block.x, block.y, block.width, block.height);
            (EncodingTag::Jpeg, jpeg(rgb, block.width, block.height, self.settings.quality)?)
        } else {
            let packed = source.region(block.x, block.y, block.width, block.height);
            let compressed = zstd::encode_all(packed.as_slice(), self.zstd_level)
                .map_err(|e| ScError::Encoding(format!("zstd encode failed: {e}")))?;
            if compressed.len() < packed.len() {
                (EncodingTag::Zstd, compressed)
            } else {
                (EncodingTag::Raw, packed)
            }
        };

        self.raw_bytes += raw_len;
        self.encoded_bytes += payload.len() as u64;

        Ok(FrameRect {
            x,
            y,
            width,
            height,
            encoding,
            flags,
            payload: Bytes::from(payload),
        })
    }
}

/// Higher quality favours speed; lower quality spends CPU on ratio.
fn zstd_level_for(quality: u8) -> i32 {
    match quality {
        90.. => 1,
        50..=89 => 3,
        _ => 6,
    }
}

/// JPEG-encode a packed RGB buffer.
pub fn jpeg(rgb: Vec<u8>, width: u32, height: u32, quality: u8) -> Result<Vec<u8>, ScError> {
    let img = RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| ScError::Encoding("invalid image dimensions".into()))?;
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    img.write_with_encoder(encoder)
        .map_err(|e| ScError::Encoding(format!("jpeg encode failed: {e}")))?;
    Ok(buf.into_inner())
}
