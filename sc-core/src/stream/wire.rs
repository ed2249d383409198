//! Binary frame wire format.
//!
//! ```text
//! frame header (10 bytes)
//!   sequence:    u32 LE
//!   timestamp:   u32 LE   ms since session start
//!   rect_count:  u16 LE
//! rect header (14 bytes) × rect_count, each followed by its payload
//!   x, y:        u16 LE
//!   width:       u16 LE
//!   height:      u16 LE
//!   encoding:    u8       see EncodingTag
//!   flags:       u8       see RectFlags
//!   payload_len: u32 LE
//! ```
//!
//! Decoding is strict: a declared length that runs past the buffer, an
//! unknown encoding tag or leftover bytes are all rejected.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ScError;

pub const FRAME_HEADER_LEN: usize = 10;
pub const RECT_HEADER_LEN: usize = 14;

/// Upper bound accepted by [`FrameCodec`] for one frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

// ── EncodingTag ──────────────────────────────────────────────────

/// How a rectangle's payload is encoded.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingTag {
    /// Packed pixels in the capture's native format.
    Raw = 0,
    /// Packed pixels, zstd-compressed.
    Zstd = 1,
    /// JPEG image of the rectangle.
    Jpeg = 2,
}

impl TryFrom<u8> for EncodingTag {
    type Error = ScError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EncodingTag::Raw),
            1 => Ok(EncodingTag::Zstd),
            2 => Ok(EncodingTag::Jpeg),
            _ => Err(ScError::UnknownVariant {
                type_name: "EncodingTag",
                value: value as u64,
            }),
        }
    }
}

bitflags! {
    /// Per-rectangle flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RectFlags: u8 {
        /// Rectangle belongs to a full (intra) frame.
        const KEYFRAME = 0x01;
    }
}

// ── FrameRect / EncodedFrame ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: EncodingTag,
    pub flags: RectFlags,
    pub payload: Bytes,
}

/// One encoded frame: header plus an ordered list of rectangles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub sequence: u32,
    pub timestamp_ms: u32,
    pub rects: Vec<FrameRect>,
}

impl EncodedFrame {
    pub fn is_keyframe(&self) -> bool {
        self.rects.iter().any(|r| r.flags.contains(RectFlags::KEYFRAME))
    }

    /// Serialized size in bytes.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_LEN
            + self
                .rects
                .iter()
                .map(|r| RECT_HEADER_LEN + r.payload.len())
                .sum::<usize>()
    }

    /// Serialize. Frames without rectangles are refused.
    pub fn encode(&self) -> Result<Bytes, ScError> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ScError> {
        if self.rects.is_empty() {
            return Err(ScError::MalformedFrame("frame has no rectangles"));
        }
        let count = u16::try_from(self.rects.len())
            .map_err(|_| ScError::MalformedFrame("too many rectangles"))?;

        buf.reserve(self.wire_len());
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.timestamp_ms);
        buf.put_u16_le(count);
        for rect in &self.rects {
            let len = u32::try_from(rect.payload.len())
                .map_err(|_| ScError::MalformedFrame("rectangle payload too large"))?;
            buf.put_u16_le(rect.x);
            buf.put_u16_le(rect.y);
            buf.put_u16_le(rect.width);
            buf.put_u16_le(rect.height);
            buf.put_u8(rect.encoding as u8);
            buf.put_u8(rect.flags.bits());
            buf.put_u32_le(len);
            buf.put_slice(&rect.payload);
        }
        Ok(())
    }

    /// Parse exactly one frame; the buffer must contain nothing else.
    pub fn decode(buf: &[u8]) -> Result<Self, ScError> {
        match Self::decode_prefix(buf)? {
            Some((frame, used)) if used == buf.len() => Ok(frame),
            Some(_) => Err(ScError::MalformedFrame("trailing bytes after frame")),
            None => Err(ScError::MalformedFrame("truncated frame")),
        }
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed; on success returns the
    /// frame and the number of bytes it occupied.
    pub fn decode_prefix(buf: &[u8]) -> Result<Option<(Self, usize)>, ScError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut cur = buf;
        let sequence = cur.get_u32_le();
        let timestamp_ms = cur.get_u32_le();
        let count = cur.get_u16_le();
        if count == 0 {
            return Err(ScError::MalformedFrame("frame has no rectangles"));
        }

        let mut rects = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if cur.remaining() < RECT_HEADER_LEN {
                return Ok(None);
            }
            let x = cur.get_u16_le();
            let y = cur.get_u16_le();
            let width = cur.get_u16_le();
            let height = cur.get_u16_le();
            let encoding = EncodingTag::try_from(cur.get_u8())?;
            let flags = RectFlags::from_bits_retain(cur.get_u8());
            let len = cur.get_u32_le() as usize;
            if len > MAX_FRAME_LEN {
                return Err(ScError::MalformedFrame("rectangle payload too large"));
            }
            if cur.remaining() < len {
                return Ok(None);
            }
            let payload = Bytes::copy_from_slice(&cur[..len]);
            cur.advance(len);
            rects.push(FrameRect {
                x,
                y,
                width,
                height,
                encoding,
                flags,
                payload,
            });
        }

        let used = buf.len() - cur.remaining();
        Ok(Some((
            EncodedFrame {
                sequence,
                timestamp_ms,
                rects,
            },
            used,
        )))
    }
}

// ── Session tagging ──────────────────────────────────────────────

/// Prefix a frame with its session id for forwarding on a shared
/// connection: `u8 id_len | id | frame`.
pub fn tag_session(session_id: &str, frame: &[u8]) -> Result<Vec<u8>, ScError> {
    let id_len = u8::try_from(session_id.len())
        .map_err(|_| ScError::MalformedFrame("session id too long"))?;
    let mut out = Vec::with_capacity(1 + session_id.len() + frame.len());
    out.push(id_len);
    out.extend_from_slice(session_id.as_bytes());
    out.extend_from_slice(frame);
    Ok(out)
}

/// Inverse of [`tag_session`].
pub fn split_session(message: &[u8]) -> Result<(&str, &[u8]), ScError> {
    let (&id_len, rest) = message
        .split_first()
        .ok_or(ScError::MalformedFrame("empty tagged frame"))?;
    if rest.len() < id_len as usize {
        return Err(ScError::MalformedFrame("truncated session id"));
    }
    let (id, frame) = rest.split_at(id_len as usize);
    let id = std::str::from_utf8(id).map_err(|_| ScError::MalformedFrame("session id not utf-8"))?;
    Ok((id, frame))
}

// ── FrameCodec ───────────────────────────────────────────────────

/// Framing for a byte stream of back-to-back wire frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = EncodedFrame;
    type Error = ScError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match EncodedFrame::decode_prefix(src)? {
            Some((frame, used)) => {
                src.advance(used);
                Ok(Some(frame))
            }
            None if src.len() > MAX_FRAME_LEN => {
                Err(ScError::MalformedFrame("frame exceeds maximum length"))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<EncodedFrame> for FrameCodec {
    type Error = ScError;

    fn encode(&mut self, item: EncodedFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: u16, tag: EncodingTag, payload: &[u8]) -> FrameRect {
        FrameRect {
            x,
            y: 7,
            width: 64,
            height: 32,
            encoding: tag,
            flags: RectFlags::empty(),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    fn sample() -> EncodedFrame {
        EncodedFrame {
            sequence: 42,
            timestamp_ms: 1_500,
            rects: vec![
                rect(0, EncodingTag::Zstd, b"abc"),
                rect(64, EncodingTag::Jpeg, b""),
                FrameRect {
                    flags: RectFlags::KEYFRAME,
                    ..rect(128, EncodingTag::Raw, &[1, 2, 3, 4])
                },
            ],
        }
    }

    #[test]
    fn encode_decode_preserves_header_and_rects() {
        let frame = sample();
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), frame.wire_len());
        assert_eq!(EncodedFrame::decode(&bytes).unwrap(), frame);
        assert!(frame.is_keyframe());
    }

    #[test]
    fn header_layout_is_little_endian() {
        let bytes = sample().encode().unwrap();
        assert_eq!(&bytes[0..4], &42u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1_500u32.to_le_bytes());
        assert_eq!(&bytes[8..10], &3u16.to_le_bytes());
        // First rect: x=0, y=7, w=64, h=32, tag=1, flags=0, len=3.
        assert_eq!(
            &bytes[10..24],
            &[0, 0, 7, 0, 64, 0, 32, 0, 1, 0, 3, 0, 0, 0]
        );
        assert_eq!(&bytes[24..27], b"abc");
    }

    #[test]
    fn empty_frame_is_never_serialized() {
        let frame = EncodedFrame {
            sequence: 1,
            timestamp_ms: 0,
            rects: vec![],
        };
        assert!(matches!(frame.encode(), Err(ScError::MalformedFrame(_))));
    }

    #[test]
    fn rejects_truncated_payload() {
        let bytes = sample().encode().unwrap();
        let err = EncodedFrame::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, ScError::MalformedFrame(_)));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes.push(0);
        assert!(EncodedFrame::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_unknown_encoding_tag() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes[18] = 9;
        assert!(matches!(
            EncodedFrame::decode(&bytes),
            Err(ScError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn rejects_zero_rect_header() {
        let mut bytes = vec![0u8; FRAME_HEADER_LEN];
        bytes[0] = 1;
        assert!(EncodedFrame::decode(&bytes).is_err());
    }

    #[test]
    fn codec_splits_back_to_back_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(sample(), &mut buf).unwrap();
        let second = EncodedFrame {
            sequence: 43,
            ..sample()
        };
        codec.encode(second.clone(), &mut buf).unwrap();

        // Feed byte-by-byte prefix first to exercise partial reads.
        let mut partial = buf.split_to(5);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        let mut buf = partial;

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().sequence, 42);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn session_tagging() {
        let tagged = tag_session("stream-1f", &[9, 9]).unwrap();
        assert_eq!(tagged[0], 9);
        let (id, frame) = split_session(&tagged).unwrap();
        assert_eq!(id, "stream-1f");
        assert_eq!(frame, &[9, 9]);
        assert!(split_session(&[5, b'a']).is_err());
        assert!(tag_session(&"x".repeat(300), &[]).is_err());
    }
}
