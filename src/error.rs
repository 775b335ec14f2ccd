//! Error types used by the servisor runtime.
//!
//! This module defines the runtime's error taxonomy:
//!
//! - [`ConfigError`] — fatal at construction (unknown id, dependency cycle,
//!   missing safety service, unreadable configuration).
//! - [`RouterError`] — transport-level receive failures; these are fatal and
//!   propagate out of the router's main loop.
//! - [`ProtocolError`] — per-message failures (malformed frame or payload,
//!   unknown tags); these are caught, logged, and answered with an error
//!   reply when a client identity is known.
//! - [`ProxyError`] — client-side facade failures (timeout, error reply,
//!   assignment to a non-property capability).
//!
//! All enums provide `as_label()` returning a short stable snake_case label
//! for logs.

use std::time::Duration;
use thiserror::Error;

/// Fatal configuration errors, raised once while building the registry.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A descriptor references a service id that no descriptor defines.
    #[error("unknown service '{id}' referenced by '{referenced_by}'")]
    UnknownService { id: String, referenced_by: String },

    /// The `depended_on_by` graph failed to peel to empty.
    #[error("dependency cycle involving services: {remainder:?}")]
    DependencyCycle { remainder: Vec<String> },

    /// A descriptor set `requires_safety` but no safety service is configured.
    #[error("service '{id}' requires safety but no safety service is configured")]
    MissingSafetyService { id: String },

    /// The configuration file could not be read or parsed.
    #[error("failed to load configuration from '{path}': {reason}")]
    Unreadable { path: String, reason: String },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::UnknownService { .. } => "config_unknown_service",
            ConfigError::DependencyCycle { .. } => "config_dependency_cycle",
            ConfigError::MissingSafetyService { .. } => "config_missing_safety",
            ConfigError::Unreadable { .. } => "config_unreadable",
        }
    }
}

/// Errors produced by the router and supervisor runtime.
///
/// Receive-level transport failures are fatal; everything that can be
/// handled per message is a [`ProtocolError`] instead and never reaches
/// this type.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RouterError {
    /// The inbound channel closed: every peer acceptor is gone.
    #[error("inbound transport closed")]
    TransportClosed,

    /// Binding a listening socket failed.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Spawning a service child process failed.
    #[error("failed to launch service '{id}': {source}")]
    Launch {
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing experiment metadata or configuration to disk failed.
    #[error("failed to persist experiment state at '{path}': {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl RouterError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RouterError::TransportClosed => "router_transport_closed",
            RouterError::Bind { .. } => "router_bind",
            RouterError::Launch { .. } => "router_launch",
            RouterError::Persist { .. } => "router_persist",
        }
    }
}

/// Per-message protocol failures.
///
/// Caught at dispatch, logged, and either answered with a structured error
/// reply (identity known) or dropped (identity unknown). They never abort
/// the router loop.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame had too few parts or an unknown source/kind tag.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// A frame exceeded the maximum encoded size.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Payload was not valid JSON or missed required fields.
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },

    /// Request named a type the target does not understand.
    #[error("unknown request type '{request_type}'")]
    UnknownRequestType { request_type: String },

    /// Request addressed a service that was never started.
    #[error("service '{id}' is not running")]
    ServiceUnavailable { id: String },
}

impl ProtocolError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProtocolError::MalformedFrame { .. } => "protocol_malformed_frame",
            ProtocolError::FrameTooLarge { .. } => "protocol_frame_too_large",
            ProtocolError::MalformedPayload { .. } => "protocol_malformed_payload",
            ProtocolError::UnknownRequestType { .. } => "protocol_unknown_request_type",
            ProtocolError::ServiceUnavailable { .. } => "protocol_service_unavailable",
        }
    }

    /// Human-readable description placed into error replies.
    ///
    /// Clients only ever see a string; no error type crosses the wire.
    pub fn as_description(&self) -> String {
        self.to_string()
    }
}

impl From<ProtocolError> for std::io::Error {
    fn from(e: ProtocolError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    }
}

/// Errors surfaced by the client/service proxy facade.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProxyError {
    /// No reply arrived within the fixed receive timeout.
    #[error("no reply within {timeout:?}")]
    Timeout { timeout: Duration },

    /// The service answered with a structured error reply.
    #[error("service replied with error: {description}")]
    ErrorReply { description: String },

    /// The reply type did not match the request type.
    #[error("mismatched reply type: expected '{expected}', got '{got}'")]
    MismatchedReply { expected: String, got: String },

    /// Assignment attempted on a command or stream capability.
    #[error("capability '{name}' is a {kind} and cannot be assigned")]
    NotAssignable { name: String, kind: &'static str },

    /// The target exposes no capability under this name.
    #[error("service exposes no capability named '{name}'")]
    UnknownCapability { name: String },

    /// Underlying connection failed.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProxyError::Timeout { .. } => "proxy_timeout",
            ProxyError::ErrorReply { .. } => "proxy_error_reply",
            ProxyError::MismatchedReply { .. } => "proxy_mismatched_reply",
            ProxyError::NotAssignable { .. } => "proxy_not_assignable",
            ProxyError::UnknownCapability { .. } => "proxy_unknown_capability",
            ProxyError::Io(_) => "proxy_io",
        }
    }
}
