//! Envelope tags and the multipart wire frame.
//!
//! Every message on the wire is one [`Frame`]: a fixed source tag, the target
//! (or originating) service name, a message-kind tag, and zero or more opaque
//! payload parts.
//!
//! ```text
//! CLIENT  request:      [CLIENT][service][REQUEST][json]
//! SERVICE registration: [SERVICE][service][REGISTER][json]
//! SERVICE reply relay:  [SERVICE][service][REPLY][client-identity][json]
//! ```
//!
//! Peer identities are owned by the transport edge (`router::peers`), so
//! frames themselves carry only the body parts; the one exception is the
//! reply relay, whose first payload part is the destination client identity
//! carried in-band.
//!
//! ## Rules
//! - Tags are fixed ASCII strings; an unrecognized tag is a
//!   [`ProtocolError::MalformedFrame`].
//! - Decoding never panics on short input.

use bytes::Bytes;

use crate::error::ProtocolError;

/// Who put the frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// A client script or the proxy facade.
    Client,
    /// A supervised service process.
    Service,
}

impl Source {
    /// Fixed wire tag for this source.
    pub fn as_tag(self) -> &'static [u8] {
        match self {
            Source::Client => b"CLIENT",
            Source::Service => b"SERVICE",
        }
    }

    /// Parses a wire tag.
    pub fn from_tag(tag: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            b"CLIENT" => Ok(Source::Client),
            b"SERVICE" => Ok(Source::Service),
            other => Err(ProtocolError::MalformedFrame {
                reason: format!("unknown source tag {:?}", String::from_utf8_lossy(other)),
            }),
        }
    }
}

/// Fixed message-type tag carried on every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Client request for a service or the supervisor itself.
    Request,
    /// Service registration handshake (pid, declared type).
    Register,
    /// Service signals it is ready to receive requests.
    Opened,
    /// Periodic service liveness beacon.
    Heartbeat,
    /// Service reply, relayed to the client identity carried in-band.
    Reply,
    /// Supervisor-to-service configuration slice.
    Configuration,
}

impl MessageKind {
    /// Fixed wire tag for this kind.
    pub fn as_tag(self) -> &'static [u8] {
        match self {
            MessageKind::Request => b"REQUEST",
            MessageKind::Register => b"REGISTER",
            MessageKind::Opened => b"OPENED",
            MessageKind::Heartbeat => b"HEARTBEAT",
            MessageKind::Reply => b"REPLY",
            MessageKind::Configuration => b"CONFIGURATION",
        }
    }

    /// Parses a wire tag.
    pub fn from_tag(tag: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            b"REQUEST" => Ok(MessageKind::Request),
            b"REGISTER" => Ok(MessageKind::Register),
            b"OPENED" => Ok(MessageKind::Opened),
            b"HEARTBEAT" => Ok(MessageKind::Heartbeat),
            b"REPLY" => Ok(MessageKind::Reply),
            b"CONFIGURATION" => Ok(MessageKind::Configuration),
            other => Err(ProtocolError::MalformedFrame {
                reason: format!("unknown message kind {:?}", String::from_utf8_lossy(other)),
            }),
        }
    }
}

/// One multipart wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Origin of the frame.
    pub source: Source,
    /// Target service for client requests; originating service otherwise.
    pub service: String,
    /// Message-type tag.
    pub kind: MessageKind,
    /// Opaque payload parts (JSON bodies, in-band identities).
    pub payloads: Vec<Bytes>,
}

impl Frame {
    /// Builds a frame with a single payload part.
    pub fn new(
        source: Source,
        service: impl Into<String>,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            source,
            service: service.into(),
            kind,
            payloads: vec![payload.into()],
        }
    }

    /// Builds a frame with no payload parts (OPENED, HEARTBEAT).
    pub fn bare(source: Source, service: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            source,
            service: service.into(),
            kind,
            payloads: Vec::new(),
        }
    }

    /// Flattens the frame into its ordered wire parts.
    pub fn into_parts(self) -> Vec<Bytes> {
        let mut parts = Vec::with_capacity(3 + self.payloads.len());
        parts.push(Bytes::from_static(self.source.as_tag()));
        parts.push(Bytes::from(self.service.into_bytes()));
        parts.push(Bytes::from_static(self.kind.as_tag()));
        parts.extend(self.payloads);
        parts
    }

    /// Reassembles a frame from its ordered wire parts.
    pub fn from_parts(parts: Vec<Bytes>) -> Result<Self, ProtocolError> {
        if parts.len() < 3 {
            return Err(ProtocolError::MalformedFrame {
                reason: format!("expected at least 3 parts, got {}", parts.len()),
            });
        }
        let mut it = parts.into_iter();
        let source = Source::from_tag(&it.next().unwrap_or_default())?;
        let service_raw = it.next().unwrap_or_default();
        let service = std::str::from_utf8(&service_raw)
            .map_err(|_| ProtocolError::MalformedFrame {
                reason: "service name is not valid utf-8".into(),
            })?
            .to_string();
        let kind = MessageKind::from_tag(&it.next().unwrap_or_default())?;
        Ok(Self {
            source,
            service,
            kind,
            payloads: it.collect(),
        })
    }

    /// First payload part, or an empty slice.
    pub fn payload(&self) -> &[u8] {
        self.payloads.first().map(|b| b.as_ref()).unwrap_or(&[])
    }
}
