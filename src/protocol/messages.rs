//! JSON payload types carried inside [`Frame`](crate::protocol::Frame)s.
//!
//! Two shapes cover every payload:
//! - [`Request`]: `{ "request_type": ..., "data": ... }`
//! - [`Reply`]: `{ "status": "ok"|"error", "description": ..., "reply_type": ..., "data": ... }`
//!
//! Fleet-management request types (target = supervisor): `require_service`,
//! `running_services`, `start_new_experiment`, `end_experiment`,
//! `output_path`, `is_simulated`, `configuration`.
//!
//! Per-service request types (forwarded verbatim): `get_property`,
//! `set_property`, `execute_command`, `all_properties`, `all_commands`,
//! `all_datastreams`.
//!
//! ## Rules
//! - Error replies carry only a string description; no error type crosses
//!   the wire.
//! - `reply_type` mirrors the `request_type` it answers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// A request payload alongside its type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// One of the fleet or per-service request types.
    pub request_type: String,
    /// Free-form request body.
    #[serde(default)]
    pub data: Value,
}

impl Request {
    /// Builds a request with a JSON body.
    pub fn new(request_type: impl Into<String>, data: Value) -> Self {
        Self {
            request_type: request_type.into(),
            data,
        }
    }

    /// Parses a request from raw payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedPayload {
            reason: e.to_string(),
        })
    }

    /// Serializes the request to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Struct of (String, Value) cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Outcome tag on every reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// A reply payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    /// `ok` or `error`.
    pub status: ReplyStatus,
    /// Human-readable description; the error message on failure.
    pub description: String,
    /// Mirrors the request type this reply answers.
    pub reply_type: String,
    /// Reply body; `null` on error.
    #[serde(default)]
    pub data: Value,
}

impl Reply {
    /// Successful reply with a body.
    pub fn ok(reply_type: impl Into<String>, data: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            description: String::new(),
            reply_type: reply_type.into(),
            data,
        }
    }

    /// Error reply; everything is normalized to a string description.
    pub fn error(reply_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            description: description.into(),
            reply_type: reply_type.into(),
            data: Value::Null,
        }
    }

    /// Parses a reply from raw payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedPayload {
            reason: e.to_string(),
        })
    }

    /// Serializes the reply to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}

/// The connection/readiness triple answered by `require_service` and, per
/// entry, by `running_services`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub service_name: String,
    pub service_type: String,
    /// A process was launched and has registered back.
    pub is_connected: bool,
    /// The service sent OPENED and accepts requests.
    pub is_open: bool,
}

/// Request body of `require_service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequireService {
    pub service_name: String,
}

/// Request body of `start_new_experiment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartNewExperiment {
    pub experiment_name: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Registration handshake body sent with REGISTER.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// OS process id of the registering service.
    pub pid: u32,
    /// Declared service type.
    pub service_type: String,
    /// Host the service listens on for direct connections.
    #[serde(default)]
    pub host: Option<String>,
    /// Port the service listens on.
    #[serde(default)]
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip() {
        let req = Request::new("set_property", json!({"property_name": "gain", "value": 2}));
        let parsed = Request::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn malformed_request_is_a_protocol_error() {
        let err = Request::from_bytes(b"{not json").unwrap_err();
        assert_eq!(err.as_label(), "protocol_malformed_payload");
    }

    #[test]
    fn error_reply_has_null_data_and_description() {
        let reply = Reply::error("get_property", "service 'camera' is not running");
        assert!(!reply.is_ok());
        assert_eq!(reply.data, Value::Null);

        let raw = reply.to_bytes();
        let v: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["description"], "service 'camera' is not running");
    }

    #[test]
    fn reply_type_mirrors_request_type() {
        let reply = Reply::ok("require_service", json!({}));
        assert_eq!(reply.reply_type, "require_service");
        assert_eq!(
            serde_json::to_value(&reply).unwrap()["status"],
            json!("ok")
        );
    }
}
