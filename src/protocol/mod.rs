//! Wire protocol: envelope tags, framing, and message payloads.
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Request / Reply payloads         │  JSON (messages)
//! ├─────────────────────────────────────────┤
//! │     Envelope: source + service + kind    │  Multipart frame (frames)
//! ├─────────────────────────────────────────┤
//! │               Framing                    │  Length-prefixed (codec)
//! ├─────────────────────────────────────────┤
//! │          Byte-stream transport           │  TCP
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Contents
//! - [`frames`]: [`Source`] and [`MessageKind`] tags, the multipart [`Frame`]
//! - [`codec`]: [`FrameCodec`] length-prefixed encoder/decoder
//! - [`messages`]: serde payload types ([`Request`], [`Reply`], fleet bodies)
//!
//! ## Rules
//! - Every frame carries a source tag and a message-kind tag.
//! - Frame size is validated **before** allocation.
//! - Errors are normalized to string descriptions inside [`Reply`]; no error
//!   type crosses the wire.

pub mod codec;
pub mod frames;
pub mod messages;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use frames::{Frame, MessageKind, Source};
pub use messages::{Reply, ReplyStatus, Request, ServiceStatus};
