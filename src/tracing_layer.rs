//! Request tracing middleware for the server side.
//!
//! [`McpTracingLayer`] wraps any `Service<ServerRequest>` and runs each call
//! inside an `mcp_request` span carrying the method, request id, session and
//! a short subject (tool name, resource URI, prompt name).
//!
//! Completions are logged at `DEBUG`, error replies at `WARN`. Calls slower
//! than [`McpTracingLayer::slow_after`] are also reported at `WARN`.
//!
//! ```rust
//! use std::time::Duration;
//! use tower::ServiceBuilder;
//! use mcp_conduit::{McpServer, McpTracingLayer};
//! use mcp_conduit::transport::StdioTransport;
//!
//! let service = ServiceBuilder::new()
//!     .layer(McpTracingLayer::new().slow_after(Duration::from_secs(2)))
//!     .service(McpServer::new("my-server", "1.0.0"));
//! let transport = StdioTransport::new(service);
//! ```

use std::convert::Infallible;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tower::Layer;
use tower_service::Service;
use tracing::Instrument;

use crate::protocol::{JsonRpcMessage, methods};
use crate::server::{ServerRequest, ServerResponse};

#[derive(Debug, Clone, Copy, Default)]
pub struct McpTracingLayer {
    slow_after: Option<Duration>,
}

impl McpTracingLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warn about requests that take longer than `threshold`.
    pub fn slow_after(mut self, threshold: Duration) -> Self {
        self.slow_after = Some(threshold);
        self
    }
}

impl<S> Layer<S> for McpTracingLayer {
    type Service = McpTracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        McpTracingService {
            inner,
            slow_after: self.slow_after,
        }
    }
}

/// Service produced by [`McpTracingLayer`].
#[derive(Debug, Clone)]
pub struct McpTracingService<S> {
    inner: S,
    slow_after: Option<Duration>,
}

impl<S> Service<ServerRequest> for McpTracingService<S>
where
    S: Service<ServerRequest, Response = ServerResponse, Error = Infallible>,
    S::Future: Send + 'static,
{
    type Response = ServerResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<ServerResponse, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ServerRequest) -> Self::Future {
        let method = req.message.method.clone().unwrap_or_default();
        let span = tracing::info_span!(
            "mcp_request",
            method = %method,
            id = req.message.id.as_ref().map(|id| id.to_string()),
            session = req.session_id.as_deref(),
            subject = subject(&req.message),
        );
        let notification = req.message.id.is_none();
        let slow_after = self.slow_after;
        let started = Instant::now();
        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let Ok(response) = fut.await;
                let elapsed = started.elapsed();
                let elapsed_ms = elapsed.as_millis() as u64;

                if let Some(err) = response.message.as_ref().and_then(|m| m.error.as_ref()) {
                    tracing::warn!(code = err.code, error = %err.message, elapsed_ms, "Request failed");
                } else if notification {
                    tracing::trace!("Notification handled");
                } else {
                    tracing::debug!(elapsed_ms, "Request completed");
                }

                if slow_after.is_some_and(|limit| elapsed > limit) {
                    tracing::warn!(elapsed_ms, "Slow request");
                }

                Ok(response)
            }
            .instrument(span),
        )
    }
}

/// What a request is about, for the span: tool or prompt name, resource URI.
fn subject(message: &JsonRpcMessage) -> Option<String> {
    let key = match message.method.as_deref()? {
        methods::TOOLS_CALL | methods::PROMPTS_GET => "name",
        methods::RESOURCES_READ => "uri",
        _ => return None,
    };
    message
        .params
        .as_ref()?
        .get(key)?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::McpServer;
    use serde_json::json;
    use tower::ServiceExt;

    #[test]
    fn test_subject() {
        let call = JsonRpcMessage::request(1, methods::TOOLS_CALL)
            .with_params(json!({"name": "add", "arguments": {}}));
        assert_eq!(subject(&call).as_deref(), Some("add"));

        let read = JsonRpcMessage::request(2, methods::RESOURCES_READ)
            .with_params(json!({"uri": "file:///a.txt"}));
        assert_eq!(subject(&read).as_deref(), Some("file:///a.txt"));

        assert_eq!(subject(&JsonRpcMessage::request(3, methods::PING)), None);
        assert_eq!(
            subject(&JsonRpcMessage::request(4, methods::PROMPTS_GET)),
            None
        );
    }

    #[tokio::test]
    async fn test_layer_passes_responses_through() {
        let service = McpTracingLayer::new()
            .slow_after(Duration::ZERO)
            .layer(McpServer::new("traced", "1.0.0"));

        let resp = service
            .oneshot(ServerRequest::new(JsonRpcMessage::request(1, "missing")))
            .await
            .unwrap();
        assert_eq!(resp.message.unwrap().error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_notifications_have_no_reply() {
        let service = McpTracingLayer::new().layer(McpServer::new("traced", "1.0.0"));

        let resp = service
            .oneshot(ServerRequest::new(JsonRpcMessage::notification(
                "notifications/initialized",
            )))
            .await
            .unwrap();
        assert!(resp.message.is_none());
    }
}
