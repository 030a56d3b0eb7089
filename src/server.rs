//! Minimal MCP server
//!
//! [`McpServer`] answers `initialize` and `ping` itself and dispatches every
//! other request to handlers registered with [`McpServer::method`]. It is a
//! tower [`Service`] over [`ServerRequest`], so it composes with
//! [`JsonRpcLayer`](crate::JsonRpcLayer) and
//! [`McpTracingLayer`](crate::McpTracingLayer), and is what the stdio loop and
//! the HTTP endpoint serve.
//!
//! Each successful `initialize` creates a session in the server's
//! [`SessionRegistry`]; later requests naming that session refresh it.
//!
//! # Example
//!
//! ```rust
//! use mcp_conduit::McpServer;
//! use serde_json::json;
//!
//! let server = McpServer::new("echo-server", "1.0.0")
//!     .instructions("Echoes its params back")
//!     .method("echo", |params| async move { Ok(params.unwrap_or(json!({}))) });
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tower_service::Service;

use crate::error::JsonRpcError;
use crate::protocol::{
    Implementation, InitializeParams, InitializeResult, JsonRpcMessage, MessageKind,
    SUPPORTED_PROTOCOL_VERSIONS, methods, notifications,
};
use crate::session::SessionRegistry;

type MethodHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, JsonRpcError>> + Send + Sync>;

/// Request type for the tower Service implementation
#[derive(Debug, Clone)]
pub struct ServerRequest {
    /// Session the message arrived on, if known
    pub session_id: Option<String>,
    pub message: JsonRpcMessage,
}

impl ServerRequest {
    pub fn new(message: JsonRpcMessage) -> Self {
        Self {
            session_id: None,
            message,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Response type for the tower Service implementation
#[derive(Debug, Clone)]
pub struct ServerResponse {
    /// Session the reply belongs to; set by `initialize` for a new session
    pub session_id: Option<String>,
    /// `None` when the request was a notification
    pub message: Option<JsonRpcMessage>,
}

impl ServerResponse {
    fn none(session_id: Option<String>) -> Self {
        Self {
            session_id,
            message: None,
        }
    }
}

/// Minimal MCP server
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

#[derive(Clone)]
struct ServerInner {
    server_info: Implementation,
    capabilities: Value,
    instructions: Option<String>,
    supported_versions: Vec<String>,
    reject_unsupported: bool,
    methods: HashMap<String, MethodHandler>,
    sessions: Arc<SessionRegistry>,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<&String> = self.inner.methods.keys().collect();
        methods.sort();
        f.debug_struct("McpServer")
            .field("server_info", &self.inner.server_info)
            .field("supported_versions", &self.inner.supported_versions)
            .field("methods", &methods)
            .finish()
    }
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                server_info: Implementation::new(name, version),
                capabilities: json!({}),
                instructions: None,
                supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
                reject_unsupported: false,
                methods: HashMap::new(),
                sessions: Arc::new(SessionRegistry::new()),
            }),
        }
    }

    /// Set instructions for LLMs describing how to use this server
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.inner).instructions = Some(instructions.into());
        self
    }

    /// Capabilities advertised in the `initialize` result
    pub fn capabilities(mut self, capabilities: Value) -> Self {
        Arc::make_mut(&mut self.inner).capabilities = capabilities;
        self
    }

    /// Versions this server accepts, newest first
    pub fn supported_versions<I, V>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let versions: Vec<String> = versions.into_iter().map(Into::into).collect();
        if !versions.is_empty() {
            Arc::make_mut(&mut self.inner).supported_versions = versions;
        }
        self
    }

    /// Answer `initialize` with an error instead of counter-proposing a version.
    pub fn reject_unsupported_versions(mut self) -> Self {
        Arc::make_mut(&mut self.inner).reject_unsupported = true;
        self
    }

    /// Use a specific session registry (for example one with a capacity limit).
    pub fn session_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        Arc::make_mut(&mut self.inner).sessions = registry;
        self
    }

    /// Register a request handler for `name`.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JsonRpcError>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |params| Box::pin(handler(params)));
        Arc::make_mut(&mut self.inner)
            .methods
            .insert(name.into(), handler);
        self
    }

    pub fn server_info(&self) -> &Implementation {
        &self.inner.server_info
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    pub fn supported_versions_list(&self) -> &[String] {
        &self.inner.supported_versions
    }

    /// Pick the version to answer an `initialize` carrying `requested` with.
    pub fn negotiate_version(&self, requested: &str) -> Result<String, JsonRpcError> {
        let supported = &self.inner.supported_versions;
        if supported.iter().any(|v| v == requested) {
            return Ok(requested.to_string());
        }
        if self.inner.reject_unsupported {
            tracing::warn!(requested = %requested, "Rejecting unsupported protocol version");
            return Err(
                JsonRpcError::invalid_params("Unsupported protocol version").with_data(json!({
                    "supported": supported,
                    "requested": requested,
                })),
            );
        }
        let fallback = supported
            .first()
            .cloned()
            .unwrap_or_else(|| crate::protocol::LATEST_PROTOCOL_VERSION.to_string());
        tracing::debug!(requested = %requested, answered = %fallback, "Counter-proposing protocol version");
        Ok(fallback)
    }

    /// Handle one message.
    pub async fn handle(&self, request: ServerRequest) -> ServerResponse {
        let ServerRequest {
            session_id,
            message,
        } = request;

        if let Some(id) = &session_id {
            self.inner.sessions.touch(id).await;
        }

        let kind = match message.kind() {
            Ok(kind) => kind,
            Err(e) => {
                tracing::debug!(error = %e, "Invalid message");
                return ServerResponse {
                    session_id,
                    message: message
                        .id
                        .map(|id| JsonRpcMessage::error_response(id, e.to_jsonrpc())),
                };
            }
        };

        match kind {
            MessageKind::Notification => {
                let method = message.method.as_deref().unwrap_or_default();
                match method {
                    notifications::INITIALIZED => {
                        tracing::info!(session_id = ?session_id, "Client initialized");
                    }
                    notifications::CANCELLED => {
                        tracing::debug!(params = ?message.params, "Client cancelled a request");
                    }
                    other => tracing::debug!(method = %other, "Ignoring notification"),
                }
                ServerResponse::none(session_id)
            }
            MessageKind::Response | MessageKind::Error => {
                tracing::debug!(id = ?message.id, "Ignoring response from client");
                ServerResponse::none(session_id)
            }
            MessageKind::Request => self.handle_request(session_id, message).await,
        }
    }

    async fn handle_request(
        &self,
        session_id: Option<String>,
        message: JsonRpcMessage,
    ) -> ServerResponse {
        let JsonRpcMessage {
            id, method, params, ..
        } = message;
        let (Some(id), Some(method)) = (id, method) else {
            return ServerResponse::none(session_id);
        };

        let (session_id, outcome) = match method.as_str() {
            methods::INITIALIZE => match self.initialize(params).await {
                Ok((new_session, result)) => (Some(new_session), Ok(result)),
                Err(e) => (session_id, Err(e)),
            },
            methods::PING => (session_id, Ok(json!({}))),
            name => match self.inner.methods.get(name) {
                Some(handler) => (session_id, handler(params).await),
                None => (session_id, Err(JsonRpcError::method_not_found(name))),
            },
        };

        let message = match outcome {
            Ok(result) => JsonRpcMessage::response(id, result),
            Err(error) => JsonRpcMessage::error_response(id, error),
        };
        ServerResponse {
            session_id,
            message: Some(message),
        }
    }

    async fn initialize(&self, params: Option<Value>) -> Result<(String, Value), JsonRpcError> {
        let params: InitializeParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid initialize params: {}", e)))?;

        let version = self.negotiate_version(&params.protocol_version)?;
        let mut metadata = Map::new();
        metadata.insert("capabilities".to_string(), params.capabilities);

        let session_id = self
            .inner
            .sessions
            .create(params.client_info.clone(), version.clone(), metadata)
            .await
            .map_err(|e| JsonRpcError::internal_error(e.to_string()))?;

        tracing::info!(
            client = %params.client_info.name,
            requested = %params.protocol_version,
            version = %version,
            session_id = %session_id,
            "Initialize"
        );

        let result = InitializeResult {
            protocol_version: version,
            capabilities: self.inner.capabilities.clone(),
            server_info: self.inner.server_info.clone(),
            instructions: self.inner.instructions.clone(),
        };
        let value = serde_json::to_value(result)
            .map_err(|e| JsonRpcError::internal_error(format!("Serialization error: {}", e)))?;
        Ok((session_id, value))
    }
}

impl Service<ServerRequest> for McpServer {
    type Response = ServerResponse;
    type Error = Infallible; // Errors are in the response
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ServerRequest) -> Self::Future {
        let server = self.clone();
        Box::pin(async move { Ok(server.handle(req).await) })
    }
}
