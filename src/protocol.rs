//! MCP protocol types based on JSON-RPC 2.0
//!
//! A single envelope type, [`JsonRpcMessage`], represents requests,
//! notifications, success responses and error responses. Its shape is
//! checked by [`JsonRpcMessage::kind`] rather than by the type system so
//! that unknown fields can be preserved for forward compatibility.
//!
//! Protocol versions are `YYYY-MM-DD` strings ordered by calendar date.
//! See [`ProtocolVersion`] and [`negotiate`].

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, JsonRpcError, Result};

/// The JSON-RPC version. MUST be "2.0".
pub const JSONRPC_VERSION: &str = "2.0";

/// The latest supported MCP protocol version.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// The oldest supported MCP protocol version.
pub const MINIMUM_PROTOCOL_VERSION: &str = "2024-11-05";

/// All supported MCP protocol versions (newest first).
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// First protocol version in which JSON-RPC batching is no longer allowed.
pub const BATCH_REMOVED_VERSION: &str = "2025-06-18";

/// First protocol version in which HTTP requests must carry `MCP-Protocol-Version`.
pub const VERSION_HEADER_REQUIRED_VERSION: &str = "2025-06-18";

/// MCP protocol version (`YYYY-MM-DD`), totally ordered by date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(NaiveDate);

impl ProtocolVersion {
    pub fn parse(s: &str) -> Result<Self> {
        let valid_shape = s.len() == 10
            && s.bytes().enumerate().all(|(i, b)| match i {
                4 | 7 => b == b'-',
                _ => b.is_ascii_digit(),
            });
        if !valid_shape {
            return Err(Error::InvalidMessage(format!(
                "Protocol version must be YYYY-MM-DD, got '{}'",
                s
            )));
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(ProtocolVersion)
            .map_err(|e| Error::InvalidMessage(format!("Invalid protocol version '{}': {}", s, e)))
    }

    /// The latest version this crate speaks.
    pub fn latest() -> Self {
        Self::known(LATEST_PROTOCOL_VERSION)
    }

    fn known(s: &str) -> Self {
        // Constants in this module are always well-formed.
        Self::parse(s).unwrap_or(ProtocolVersion(NaiveDate::MIN))
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ProtocolVersion::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Pick the first of the client's versions (in its preference order) that
/// the server also supports.
pub fn negotiate<C, S>(client: &[C], server: &[S]) -> Result<String>
where
    C: AsRef<str>,
    S: AsRef<str>,
{
    client
        .iter()
        .map(AsRef::as_ref)
        .find(|v| server.iter().any(|s| s.as_ref() == *v))
        .map(str::to_string)
        .ok_or_else(|| Error::VersionMismatch {
            requested: client
                .first()
                .map(|v| v.as_ref().to_string())
                .unwrap_or_default(),
            supported: server.iter().map(|s| s.as_ref().to_string()).collect(),
        })
}

/// Whether a JSON-RPC batch may be exchanged under `version`.
///
/// Batching is allowed before a version is known and for every version older
/// than [`BATCH_REMOVED_VERSION`]. Unparseable versions never allow it.
pub fn supports_batching(version: Option<&str>) -> bool {
    match version {
        None => true,
        Some(v) => match ProtocolVersion::parse(v) {
            Ok(parsed) => parsed < ProtocolVersion::known(BATCH_REMOVED_VERSION),
            Err(_) => {
                tracing::debug!(version = %v, "Unrecognized protocol version, batching disabled");
                false
            }
        },
    }
}

/// Whether HTTP requests must carry the `MCP-Protocol-Version` header under `version`.
pub fn requires_version_header(version: &str) -> bool {
    ProtocolVersion::parse(version)
        .map(|v| v >= ProtocolVersion::known(VERSION_HEADER_REQUIRED_VERSION))
        .unwrap_or(false)
}

/// Request ID - can be string or number per JSON-RPC spec
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        RequestId::Number(n as i64)
    }
}

/// The four legal JSON-RPC message shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `method` and `id` present
    Request,
    /// `method` present, `id` absent
    Notification,
    /// `id` and `result` present
    Response,
    /// `id` and `error` present
    Error,
}

/// JSON-RPC 2.0 message envelope.
///
/// Fields the envelope does not know about are kept in `extra` and written
/// back out on serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JsonRpcMessage {
    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
            meta: None,
            extra: Map::new(),
        }
    }

    pub fn request(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.into()),
            ..Self::empty()
        }
    }

    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            ..Self::empty()
        }
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::empty()
        }
    }

    pub fn error_response(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            id: Some(id),
            error: Some(error),
            ..Self::empty()
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Classify the message, rejecting shapes JSON-RPC does not allow.
    pub fn kind(&self) -> Result<MessageKind> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(Error::InvalidMessage(format!(
                "Invalid JSON-RPC version: expected '{}', got '{}'",
                JSONRPC_VERSION, self.jsonrpc
            )));
        }
        if let Some(params) = &self.params
            && !(params.is_object() || params.is_array())
        {
            return Err(Error::InvalidMessage(
                "params must be an object or an array".to_string(),
            ));
        }

        let has_outcome = self.result.is_some() || self.error.is_some();
        match (&self.method, &self.id) {
            (Some(_), _) if has_outcome => Err(Error::InvalidMessage(
                "message has both a method and a result/error".to_string(),
            )),
            (Some(_), Some(_)) => Ok(MessageKind::Request),
            (Some(_), None) => Ok(MessageKind::Notification),
            (None, Some(_)) => match (&self.result, &self.error) {
                (Some(_), None) => Ok(MessageKind::Response),
                (None, Some(_)) => Ok(MessageKind::Error),
                (Some(_), Some(_)) => Err(Error::InvalidMessage(
                    "response has both result and error".to_string(),
                )),
                (None, None) => Err(Error::InvalidMessage(
                    "response has neither result nor error".to_string(),
                )),
            },
            (None, None) => Err(Error::InvalidMessage(
                "message has neither a method nor an id".to_string(),
            )),
        }
    }

    /// Returns true if this message expects no reply.
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }

    /// Turn a response into the caller-facing outcome.
    pub fn into_outcome(self) -> Result<Value> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(Error::from_response(error)),
            (Some(result), None) => Ok(result),
            (None, None) => Err(Error::InvalidMessage(
                "response has neither result nor error".to_string(),
            )),
        }
    }

    /// Build a message from a raw JSON map, validating its shape.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::InvalidMessage(
                "JSON-RPC message must be an object".to_string(),
            ));
        }
        let message: JsonRpcMessage = serde_json::from_value(value)
            .map_err(|e| Error::InvalidMessage(e.to_string()))?;
        message.kind()?;
        Ok(message)
    }

    /// Convert to a raw JSON map.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// An error response that may be addressed to no particular request.
///
/// JSON-RPC requires `"id": null` when the request id could not be
/// determined, which [`JsonRpcMessage`] deliberately cannot represent.
pub fn error_value(id: Option<&RequestId>, error: &JsonRpcError) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error,
    })
}

/// MCP method names
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
}

/// MCP notification methods
pub mod notifications {
    /// Sent by client after receiving initialize response
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Sent when a request is cancelled
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Progress updates for long-running operations
    pub const PROGRESS: &str = "notifications/progress";
    /// Log message notification
    pub const MESSAGE: &str = "notifications/message";
}

/// Name and version of an MCP peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            title: None,
        }
    }
}

/// Parameters of the `initialize` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default = "empty_object")]
    pub capabilities: Value,
    pub client_info: Implementation,
}

/// Result of the `initialize` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default = "empty_object")]
    pub capabilities: Value,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
