//! JSON-RPC 2.0 service layer
//!
//! Provides a Tower [`Layer`] and [`Service`] that turn raw JSON payloads
//! into [`ServerRequest`]s for an MCP server service and collect the replies.
//!
//! - [`JsonRpcLayer`] - Tower layer for [`ServiceBuilder`](tower::ServiceBuilder) composition
//! - [`JsonRpcService`] - Tower service wrapping an MCP server
//!
//! The service handles:
//! - Single message processing
//! - Batch processing, gated on the negotiated protocol version
//! - Session tracking for connection-bound transports (stdio, in-memory)
//! - Error conversion to JSON-RPC error responses

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use serde_json::Value;
use tower::{Layer, ServiceExt};
use tower_service::Service;

use crate::batch::BatchProcessor;
use crate::error::{Error, JsonRpcError};
use crate::protocol::{JsonRpcMessage, RequestId, error_value, methods};
use crate::server::{ServerRequest, ServerResponse};

/// Tower layer that adds JSON-RPC 2.0 framing to an MCP service.
///
/// # Example
///
/// ```rust
/// use tower::ServiceBuilder;
/// use mcp_conduit::{JsonRpcLayer, McpServer};
///
/// let server = McpServer::new("my-server", "1.0.0");
/// let service = ServiceBuilder::new()
///     .layer(JsonRpcLayer::new())
///     .service(server);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcLayer {
    _priv: (),
}

impl JsonRpcLayer {
    /// Create a new `JsonRpcLayer`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl<S> Layer<S> for JsonRpcLayer {
    type Service = JsonRpcService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JsonRpcService::new(inner)
    }
}

/// Outcome of dispatching one payload.
#[derive(Debug, Default)]
pub struct Dispatched {
    /// Reply to send back, if any
    pub reply: Option<Value>,
    /// `(session_id, protocol_version)` when the payload created a session
    pub created_session: Option<(String, String)>,
}

/// Service that handles JSON-RPC framing.
///
/// Clones share the connection state: the session created by `initialize`
/// and the batch processor tracking its negotiated version.
pub struct JsonRpcService<S> {
    inner: S,
    batch: Arc<RwLock<BatchProcessor>>,
    session_id: Arc<RwLock<Option<String>>>,
}

impl<S> Clone for JsonRpcService<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            batch: self.batch.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

impl<S> JsonRpcService<S> {
    /// Create a new JSON-RPC service wrapping the given inner service
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            batch: Arc::new(RwLock::new(BatchProcessor::default())),
            session_id: Arc::new(RwLock::new(None)),
        }
    }

    /// Session created on this connection, if `initialize` has succeeded.
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Version negotiated on this connection.
    pub fn protocol_version(&self) -> Option<String> {
        self.processor().protocol_version().map(str::to_string)
    }

    fn processor(&self) -> BatchProcessor {
        self.batch.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl<S> JsonRpcService<S>
where
    S: Service<ServerRequest, Response = ServerResponse, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    /// Process one payload on this connection and return the reply, if any.
    pub async fn call_payload(&self, payload: Value) -> Option<Value> {
        let processor = self.processor();
        let dispatched = self.dispatch(&processor, self.session_id(), payload).await;

        if let Some((session_id, version)) = dispatched.created_session {
            *self.session_id.write().unwrap_or_else(|e| e.into_inner()) = Some(session_id);
            self.batch
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .set_protocol_version(Some(version));
        }
        dispatched.reply
    }

    /// Process one payload under an explicit processor and session.
    ///
    /// Used by transports that keep per-session state themselves.
    pub async fn dispatch(
        &self,
        processor: &BatchProcessor,
        session_id: Option<String>,
        payload: Value,
    ) -> Dispatched {
        let created: Arc<Mutex<Option<(String, String)>>> = Arc::new(Mutex::new(None));
        let single_id = discover_single_id(&payload);

        let outcome = processor
            .process(payload, |item| {
                let inner = self.inner.clone();
                let session_id = session_id.clone();
                let created = created.clone();
                async move {
                    let message = JsonRpcMessage::from_value(item)?;
                    process_message(inner, session_id, message, created).await
                }
            })
            .await;

        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(error = %e, "Rejecting invalid message");
                Some(error_value(single_id.as_ref(), &e.to_jsonrpc()))
            }
        };
        let created_session = created.lock().unwrap_or_else(|e| e.into_inner()).take();
        Dispatched {
            reply,
            created_session,
        }
    }
}

/// Helper function to process a single JSON-RPC message
async fn process_message<S>(
    inner: S,
    session_id: Option<String>,
    message: JsonRpcMessage,
    created: Arc<Mutex<Option<(String, String)>>>,
) -> crate::error::Result<Option<Value>>
where
    S: Service<ServerRequest, Response = ServerResponse, Error = Infallible> + Send + 'static,
    S::Future: Send,
{
    let is_initialize = message.method.as_deref() == Some(methods::INITIALIZE);
    let request = ServerRequest {
        session_id: session_id.clone(),
        message,
    };

    let Ok(response) = inner.oneshot(request).await;

    let Some(reply) = response.message else {
        return Ok(None);
    };
    if is_initialize
        && let (Some(new_session), Some(result)) = (&response.session_id, &reply.result)
        && response.session_id != session_id
    {
        let version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        *created.lock().unwrap_or_else(|e| e.into_inner()) = Some((new_session.clone(), version));
    }

    match reply.to_value() {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize response");
            Err(Error::Internal(format!("Serialization error: {}", e)))
        }
    }
}

fn discover_single_id(payload: &Value) -> Option<RequestId> {
    payload
        .as_object()
        .and_then(|obj| obj.get("id"))
        .filter(|id| !id.is_null())
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}

impl<S> Service<Value> for JsonRpcService<S>
where
    S: Service<ServerRequest, Response = ServerResponse, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    type Response = Option<Value>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, payload: Value) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.call_payload(payload).await) })
    }
}

/// Shorthand for a parse-error reply to bytes that were not JSON.
pub fn parse_error_reply(detail: impl std::fmt::Display) -> Value {
    error_value(
        None,
        &JsonRpcError::parse_error(format!("Invalid JSON: {}", detail)),
    )
}
