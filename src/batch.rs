//! Version-gated JSON-RPC batch handling
//!
//! Batches were removed from MCP in protocol version 2025-06-18. A
//! [`BatchProcessor`] tracks the negotiated version and either fans a batch
//! out to a per-message handler or rejects it as a whole.

use std::future::Future;

use serde_json::Value;

use crate::error::{Error, JsonRpcError, Result};
use crate::protocol::{RequestId, error_value, supports_batching};

/// Applies a handler to single messages and, when allowed, to batches.
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    protocol_version: Option<String>,
    batching_enabled: bool,
}

impl Default for BatchProcessor {
    fn default() -> Self {
        Self::new(None)
    }
}

impl BatchProcessor {
    pub fn new(protocol_version: Option<String>) -> Self {
        let batching_enabled = supports_batching(protocol_version.as_deref());
        Self {
            protocol_version,
            batching_enabled,
        }
    }

    /// Record the negotiated version and recompute whether batching is allowed.
    pub fn set_protocol_version(&mut self, version: Option<String>) {
        self.batching_enabled = supports_batching(version.as_deref());
        tracing::debug!(
            version = ?version,
            batching = self.batching_enabled,
            "Batch processor version updated"
        );
        self.protocol_version = version;
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    pub fn batching_enabled(&self) -> bool {
        self.batching_enabled
    }

    /// Whether `payload` can be processed under the current version.
    pub fn can_process_batch(&self, payload: &Value) -> bool {
        !payload.is_array() || self.batching_enabled
    }

    /// Process a single message or a batch.
    ///
    /// For a single message the handler's outcome is returned as is. For a
    /// batch the handler runs once per element; `None` outcomes
    /// (notifications) leave no slot, and a failing element becomes an
    /// internal-error slot without affecting its siblings. An all-notification
    /// batch yields `Ok(None)`.
    pub async fn process<F, Fut>(&self, payload: Value, handler: F) -> Result<Option<Value>>
    where
        F: Fn(Value) -> Fut,
        Fut: Future<Output = Result<Option<Value>>>,
    {
        let items = match payload {
            Value::Array(items) => items,
            single => return handler(single).await,
        };

        if items.is_empty() {
            return Ok(Some(error_value(
                None,
                &JsonRpcError::invalid_request("Empty batch request"),
            )));
        }

        if !self.batching_enabled {
            let protocol_version = self.protocol_version.clone().unwrap_or_default();
            tracing::warn!(
                version = %protocol_version,
                size = items.len(),
                "Rejecting batch for protocol version without batching"
            );
            let error = Error::BatchRejected { protocol_version }.to_jsonrpc();
            let first_id = items.iter().find_map(discover_id);
            return Ok(Some(error_value(first_id.as_ref(), &error)));
        }

        let slots = futures::future::join_all(items.into_iter().map(|item| {
            let id = discover_id(&item);
            let fut = handler(item);
            async move {
                match fut.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::warn!(id = ?id, error = %e, "Batch element failed");
                        Some(error_value(
                            id.as_ref(),
                            &JsonRpcError::internal_error(e.to_string()),
                        ))
                    }
                }
            }
        }))
        .await;

        let responses: Vec<Value> = slots.into_iter().flatten().collect();
        if responses.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Value::Array(responses)))
        }
    }
}

/// Best-effort id of a raw batch element, even when it is otherwise malformed.
fn discover_id(item: &Value) -> Option<RequestId> {
    item.get("id")
        .filter(|id| !id.is_null())
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcMessage;
    use serde_json::json;

    async fn echo_handler(item: Value) -> Result<Option<Value>> {
        let msg = JsonRpcMessage::from_value(item)?;
        match msg.id {
            Some(id) => Ok(Some(
                JsonRpcMessage::response(id, msg.params.unwrap_or(json!({}))).to_value()?,
            )),
            None => Ok(None),
        }
    }

    #[test]
    fn test_batch_gating_by_version() {
        let batch = json!([{"jsonrpc": "2.0", "id": 1, "method": "ping"}]);
        let single = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});

        let old = BatchProcessor::new(Some("2025-03-26".to_string()));
        assert!(old.can_process_batch(&batch));
        assert!(old.can_process_batch(&single));

        let new = BatchProcessor::new(Some("2025-06-18".to_string()));
        assert!(!new.can_process_batch(&batch));
        assert!(new.can_process_batch(&single));

        let unknown = BatchProcessor::default();
        assert!(unknown.can_process_batch(&batch));
    }

    #[test]
    fn test_set_protocol_version_recomputes() {
        let mut processor = BatchProcessor::default();
        assert!(processor.batching_enabled());
        processor.set_protocol_version(Some("2025-06-18".to_string()));
        assert!(!processor.batching_enabled());
        processor.set_protocol_version(Some("2024-11-05".to_string()));
        assert!(processor.batching_enabled());
        assert_eq!(processor.protocol_version(), Some("2024-11-05"));
    }

    #[tokio::test]
    async fn test_single_message_passes_through() {
        let processor = BatchProcessor::new(Some("2025-06-18".to_string()));
        let out = processor
            .process(
                json!({"jsonrpc": "2.0", "id": 4, "method": "echo", "params": {"x": 1}}),
                echo_handler,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out["id"], 4);
        assert_eq!(out["result"]["x"], 1);
    }

    #[tokio::test]
    async fn test_batch_elements_are_independent() {
        let processor = BatchProcessor::new(Some("2025-03-26".to_string()));
        let payload = json!([
            {"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {"ok": true}},
            {"jsonrpc": "2.0", "id": 2, "bogus": true}
        ]);

        let out = processor.process(payload, echo_handler).await.unwrap().unwrap();
        let slots = out.as_array().unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0]["result"]["ok"], true);
        assert_eq!(slots[1]["id"], 2);
        assert_eq!(slots[1]["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn test_rejected_batch_addressed_to_first_id() {
        let processor = BatchProcessor::new(Some("2025-06-18".to_string()));
        let payload = json!([
            {"jsonrpc": "2.0", "method": "notifications/progress"},
            {"jsonrpc": "2.0", "id": "abc", "method": "ping"}
        ]);

        let out = processor.process(payload, echo_handler).await.unwrap().unwrap();
        assert_eq!(out["id"], "abc");
        assert_eq!(out["error"]["code"], -32600);
        assert_eq!(out["error"]["data"]["protocolVersion"], "2025-06-18");

        let anonymous = processor
            .process(json!([{"jsonrpc": "2.0", "method": "x"}]), echo_handler)
            .await
            .unwrap()
            .unwrap();
        assert!(anonymous["id"].is_null());
    }

    #[tokio::test]
    async fn test_all_notification_batch_yields_nothing() {
        let processor = BatchProcessor::default();
        let payload = json!([
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
            {"jsonrpc": "2.0", "method": "notifications/progress"}
        ]);
        assert!(processor.process(payload, echo_handler).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_batch_is_invalid_request() {
        let processor = BatchProcessor::default();
        let out = processor.process(json!([]), echo_handler).await.unwrap().unwrap();
        assert_eq!(out["error"]["code"], -32600);
        assert!(out["id"].is_null());
    }
}
