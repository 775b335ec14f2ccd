//! Length-prefixed multipart frame codec.
//!
//! Wire format, per message:
//!
//! ```text
//! +---------------------+---------------------------------------------+
//! | total len (u32, BE) | parts: [part len (u32, BE)][part bytes] ... |
//! +---------------------+---------------------------------------------+
//! ```
//!
//! ## Rules
//! - `total len` counts everything after itself; it is validated against
//!   [`MAX_FRAME_SIZE`] **before** any allocation.
//! - Part lengths must sum exactly to the total; trailing or truncated bytes
//!   are a malformed frame.
//! - The decoder is incremental: it returns `None` until a whole message is
//!   buffered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::protocol::frames::Frame;

/// Maximum encoded frame size: 16 MiB.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encoder/decoder between [`Frame`]s and the length-prefixed wire format.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let parts = frame.into_parts();
        let total: usize = parts.iter().map(|p| 4 + p.len()).sum();
        if total > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        dst.reserve(4 + total);
        dst.put_u32(total as u32);
        for part in parts {
            dst.put_u32(part.len() as u32);
            dst.put_slice(&part);
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let total = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if total > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: MAX_FRAME_SIZE,
            }
            .into());
        }
        if src.len() < 4 + total {
            src.reserve(4 + total - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut body = src.split_to(total);
        let mut parts: Vec<Bytes> = Vec::new();
        while !body.is_empty() {
            if body.len() < 4 {
                return Err(ProtocolError::MalformedFrame {
                    reason: "truncated part header".into(),
                }
                .into());
            }
            let len = body.get_u32() as usize;
            if body.len() < len {
                return Err(ProtocolError::MalformedFrame {
                    reason: format!("part of {len} bytes overruns frame"),
                }
                .into());
            }
            parts.push(body.split_to(len).freeze());
        }

        Frame::from_parts(parts).map(Some).map_err(Into::into)
    }
}
