//! Wire codec for JSON-RPC messages
//!
//! Messages are written as compact JSON, one value per line. A decoded line
//! is either a single message or a batch; batch elements are decoded
//! independently so one malformed element does not discard its siblings.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::JsonRpcMessage;

/// A decoded wire unit.
#[derive(Debug)]
pub enum Frame {
    /// A single JSON object
    Single(JsonRpcMessage),
    /// A JSON array; each element decoded on its own
    Batch(Vec<Result<JsonRpcMessage>>),
}

impl Frame {
    /// Flatten into successfully decoded messages, logging element failures.
    pub fn into_messages(self) -> Vec<JsonRpcMessage> {
        match self {
            Frame::Single(msg) => vec![msg],
            Frame::Batch(items) => items
                .into_iter()
                .enumerate()
                .filter_map(|(index, item)| match item {
                    Ok(msg) => Some(msg),
                    Err(e) => {
                        tracing::warn!(index, error = %e, "Dropping malformed batch element");
                        None
                    }
                })
                .collect(),
        }
    }
}

/// Serialize a message to compact JSON.
pub fn encode(message: &JsonRpcMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Serialize a message followed by a single newline.
pub fn encode_line(message: &JsonRpcMessage) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Deserialize exactly one message.
///
/// Fails with [`Error::Parse`] for invalid JSON and [`Error::InvalidMessage`]
/// for JSON that is not a valid JSON-RPC message.
pub fn decode(bytes: &[u8]) -> Result<JsonRpcMessage> {
    let value: Value =
        serde_json::from_slice(trim_ascii(bytes)).map_err(|e| Error::Parse(e.to_string()))?;
    JsonRpcMessage::from_value(value)
}

/// Decode one line of input as a single message or a batch.
pub fn decode_frame(line: &str) -> Result<Frame> {
    decode_frame_bytes(line.as_bytes())
}

/// Like [`decode_frame`], for a raw line straight off a byte stream.
///
/// Bytes that are not UTF-8 fail with [`Error::Parse`] like any other
/// malformed JSON.
pub fn decode_frame_bytes(line: &[u8]) -> Result<Frame> {
    let value: Value =
        serde_json::from_slice(trim_ascii(line)).map_err(|e| Error::Parse(e.to_string()))?;
    decode_value(value)
}

/// Decode an already-parsed JSON value as a single message or a batch.
pub fn decode_value(value: Value) -> Result<Frame> {
    match value {
        Value::Array(items) => Ok(Frame::Batch(
            items.into_iter().map(JsonRpcMessage::from_value).collect(),
        )),
        Value::Object(_) => JsonRpcMessage::from_value(value).map(Frame::Single),
        other => Err(Error::InvalidMessage(format!(
            "expected a JSON object or array, got {}",
            json_type_name(&other)
        ))),
    }
}

pub(crate) fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageKind, RequestId};
    use serde_json::{Map, json};

    #[test]
    fn test_line_framing_roundtrip() {
        let mut meta = Map::new();
        meta.insert("progressToken".to_string(), json!(42));
        let request = JsonRpcMessage::request("req-1", "tools/call")
            .with_params(json!({"name": "echo", "arguments": {"text": "hi"}}))
            .with_meta(meta);

        let bytes = encode_line(&request).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);

        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"_meta\""));

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.id, Some(RequestId::from("req-1")));
        assert_eq!(decoded.meta.unwrap()["progressToken"], 42);
    }

    #[test]
    fn test_decode_errors_are_distinguished() {
        assert!(matches!(decode(b"{not json"), Err(Error::Parse(_))));
        assert!(matches!(
            decode(br#"{"jsonrpc":"2.0"}"#),
            Err(Error::InvalidMessage(_))
        ));
        assert!(matches!(decode(b"[1, 2]"), Err(Error::InvalidMessage(_))));
    }

    #[test]
    fn test_batch_elements_decoded_independently() {
        let line = r#"[{"jsonrpc":"2.0","id":1,"result":{}},{"bogus":true},{"jsonrpc":"2.0","method":"notifications/progress"}]"#;
        let frame = decode_frame(line).unwrap();
        let Frame::Batch(items) = frame else {
            panic!("expected batch");
        };
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
        assert_eq!(
            items[2].as_ref().unwrap().kind().unwrap(),
            MessageKind::Notification
        );

        let messages = decode_frame(line).unwrap().into_messages();
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_invalid_utf8_line_is_parse_error() {
        assert!(matches!(
            decode_frame_bytes(b"\xff\xfe garbage\n"),
            Err(Error::Parse(_))
        ));
        let frame = decode_frame_bytes(br#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(matches!(frame, Frame::Single(_)));
    }

    #[test]
    fn test_scalar_frame_rejected() {
        assert!(matches!(decode_frame("42"), Err(Error::InvalidMessage(_))));
        assert!(matches!(decode_frame("  "), Err(Error::Parse(_))));
    }
}
