//! Error types for mcp-conduit
//!
//! Two layers of errors live here:
//!
//! - [`JsonRpcError`] is the wire-level error object carried inside a
//!   JSON-RPC error response.
//! - [`Error`] is what callers of this crate see. Its variants separate
//!   connection failures, timeouts, version mismatches and retryable vs.
//!   non-retryable peer failures so that recovery logic (for example an
//!   OAuth refresh-and-retry wrapper) can branch on the kind of failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Boxed error type used at API boundaries that accept arbitrary errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// JSON-RPC and MCP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Invalid JSON was received
    ParseError = -32700,
    /// The JSON sent is not a valid Request object
    InvalidRequest = -32600,
    /// The method does not exist / is not available
    MethodNotFound = -32601,
    /// Invalid method parameter(s)
    InvalidParams = -32602,
    /// Internal JSON-RPC error
    InternalError = -32603,
    /// The connection to the peer closed or could not be used
    ConnectionClosed = -32000,
    /// The request did not complete in time
    RequestTimeout = -32001,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Lowest code of the implementation-defined server error band (-32099..=-32000).
pub const SERVER_ERROR_START: i32 = -32099;

/// Highest code of the implementation-defined server error band.
pub const SERVER_ERROR_END: i32 = -32000;

/// Returns true if `code` lies in the JSON-RPC reserved server error band.
pub fn is_server_error(code: i32) -> bool {
    (SERVER_ERROR_START..=SERVER_ERROR_END).contains(&code)
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionClosed, message)
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// mcp-conduit error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The channel could not be established, or died while in use.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Bytes on the wire were not valid JSON.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Well-formed JSON that violates the JSON-RPC/MCP message shape.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// No matching response arrived within the caller's bound.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The peer cannot satisfy the proposed protocol version.
    #[error("Protocol version mismatch: requested {requested}, supported {supported:?}")]
    VersionMismatch {
        requested: String,
        supported: Vec<String>,
    },

    /// Transient failure that may succeed after refreshing credentials.
    #[error("Retryable error: {0}")]
    Retryable(JsonRpcError),

    /// Structural failure unlikely to succeed on retry.
    #[error("Non-retryable error: {0}")]
    NonRetryable(JsonRpcError),

    /// A batch was sent to a peer whose negotiated version forbids batching.
    #[error("Batch rejected: protocol version {protocol_version} does not support batching")]
    BatchRejected { protocol_version: String },

    /// Error response returned by the peer.
    #[error("JSON-RPC error: {0}")]
    JsonRpc(JsonRpcError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build the caller-facing error for an error response from the peer.
    ///
    /// `ConnectionClosed` responses are synthesized by transports when the
    /// underlying channel fails, so they surface as [`Error::Connection`].
    pub fn from_response(error: JsonRpcError) -> Self {
        if error.code == ErrorCode::ConnectionClosed.code() {
            Error::Connection(error.message)
        } else {
            Error::JsonRpc(error)
        }
    }

    /// Whether retrying (possibly after refreshing credentials) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retryable(_))
    }

    /// Whether this error means the connection is unusable.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Convert to a JSON-RPC error object suitable for sending to a peer.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        match self {
            Error::JsonRpc(e) | Error::Retryable(e) | Error::NonRetryable(e) => e.clone(),
            Error::Parse(msg) => JsonRpcError::parse_error(msg.clone()),
            Error::InvalidMessage(msg) => JsonRpcError::invalid_request(msg.clone()),
            Error::BatchRejected { protocol_version } => JsonRpcError::invalid_request(format!(
                "Batch requests are not supported in protocol version {}",
                protocol_version
            ))
            .with_data(serde_json::json!({ "protocolVersion": protocol_version })),
            Error::VersionMismatch {
                requested,
                supported,
            } => JsonRpcError::invalid_params("Unsupported protocol version")
                .with_data(serde_json::json!({
                    "requested": requested,
                    "supported": supported,
                })),
            Error::Connection(msg) => JsonRpcError::connection_closed(msg.clone()),
            Error::Timeout(d) => JsonRpcError::new(
                ErrorCode::RequestTimeout,
                format!("Request timed out after {:?}", d),
            ),
            e => JsonRpcError::internal_error(e.to_string()),
        }
    }
}

impl From<JsonRpcError> for Error {
    fn from(err: JsonRpcError) -> Self {
        Error::JsonRpc(err)
    }
}

/// Result type alias for mcp-conduit
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_band() {
        assert!(is_server_error(-32000));
        assert!(is_server_error(-32050));
        assert!(is_server_error(-32099));
        assert!(!is_server_error(-32100));
        assert!(!is_server_error(-31999));
        assert!(!is_server_error(ErrorCode::InternalError.code()));
    }

    #[test]
    fn test_connection_closed_response_maps_to_connection_error() {
        let err = Error::from_response(JsonRpcError::connection_closed("child exited"));
        assert!(err.is_connection());

        let err = Error::from_response(JsonRpcError::method_not_found("nope"));
        assert!(matches!(err, Error::JsonRpc(e) if e.code == -32601));
    }

    #[test]
    fn test_batch_rejected_carries_version() {
        let err = Error::BatchRejected {
            protocol_version: "2025-06-18".to_string(),
        };
        let wire = err.to_jsonrpc();
        assert_eq!(wire.code, ErrorCode::InvalidRequest.code());
        assert_eq!(wire.data.unwrap()["protocolVersion"], "2025-06-18");
    }
}
