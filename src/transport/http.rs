//! Streamable HTTP transport for MCP servers
//!
//! Serves an [`McpServer`] (or any service over [`ServerRequest`]) on a
//! single endpoint:
//!
//! - `POST /` carries one JSON-RPC payload. `initialize` creates a session
//!   and returns its id in the `Mcp-Session-Id` header; every other payload
//!   must carry that header.
//! - `DELETE /` ends the session named by the header.
//! - `GET /sse` and `POST /messages?session_id=...` implement the legacy SSE
//!   binding: the stream's first `endpoint` event names the URL to post to,
//!   and replies arrive as `message` events.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp_conduit::McpServer;
//! use mcp_conduit::transport::HttpTransport;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = McpServer::new("my-server", "1.0.0");
//!
//!     let transport = HttpTransport::new(server).session_ttl(Duration::from_secs(60 * 60));
//!
//!     // Run on localhost:3000
//!     transport.serve("127.0.0.1:3000").await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response, Sse, sse::Event, sse::KeepAlive},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_service::Service;

use super::{DEFAULT_CHANNEL_CAPACITY, MCP_PROTOCOL_VERSION_HEADER, MCP_SESSION_ID_HEADER};
use crate::batch::BatchProcessor;
use crate::error::{Error, Result};
use crate::jsonrpc::{JsonRpcService, parse_error_reply};
use crate::protocol::{SUPPORTED_PROTOCOL_VERSIONS, methods, requires_version_header};
use crate::server::{McpServer, ServerRequest, ServerResponse};
use crate::session::SessionRegistry;

/// Default session TTL: 30 minutes
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// SSE event type for JSON-RPC messages
const SSE_MESSAGE_EVENT: &str = "message";

/// SSE event type announcing the message endpoint
const SSE_ENDPOINT_EVENT: &str = "endpoint";

/// Shared state for the HTTP transport
struct AppState<S> {
    inner: S,
    service: JsonRpcService<S>,
    sessions: Arc<SessionRegistry>,
    legacy: Mutex<HashMap<String, LegacyConnection<S>>>,
}

/// One open legacy SSE stream. Each has its own connection state, like a
/// stdio connection.
struct LegacyConnection<S> {
    service: JsonRpcService<S>,
    events: mpsc::Sender<Value>,
}

impl<S: Clone> Clone for LegacyConnection<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S> AppState<S> {
    fn legacy_connection(&self, id: &str) -> Option<LegacyConnection<S>>
    where
        S: Clone,
    {
        self.lock_legacy().get(id).cloned()
    }

    fn lock_legacy(&self) -> std::sync::MutexGuard<'_, HashMap<String, LegacyConnection<S>>> {
        self.legacy.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes a legacy connection when its event stream is dropped.
struct LegacyGuard<S> {
    id: String,
    state: Arc<AppState<S>>,
}

impl<S> Drop for LegacyGuard<S> {
    fn drop(&mut self) {
        self.state.lock_legacy().remove(&self.id);
        tracing::debug!(connection = %self.id, "Legacy SSE stream closed");
    }
}

/// HTTP transport for MCP servers
///
/// Sessions idle for longer than the TTL are removed by a background sweep
/// that runs at half the TTL (at least once a second).
pub struct HttpTransport<S = McpServer> {
    service: S,
    sessions: Arc<SessionRegistry>,
    session_ttl: Duration,
}

impl HttpTransport<McpServer> {
    /// Create a new HTTP transport serving `server` and its session registry
    pub fn new(server: McpServer) -> Self {
        let sessions = server.sessions().clone();
        Self::with_sessions(server, sessions)
    }
}

impl<S> HttpTransport<S>
where
    S: Service<ServerRequest, Response = ServerResponse, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    /// Serve an arbitrary service, typically an [`McpServer`] wrapped in
    /// middleware, validating sessions against `sessions`.
    pub fn with_sessions(service: S, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            service,
            sessions,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    /// Set the session time-to-live
    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Build the axum router for this transport
    ///
    /// This also starts the background session sweep, which stops once the
    /// router is dropped.
    pub fn into_router(self) -> Router {
        let state = Arc::new(AppState {
            inner: self.service.clone(),
            service: JsonRpcService::new(self.service),
            sessions: self.sessions,
            legacy: Mutex::new(HashMap::new()),
        });

        spawn_sweeper(Arc::downgrade(&state), self.session_ttl);

        Router::new()
            .route("/", post(handle_post::<S>).delete(handle_delete::<S>))
            .route("/sse", get(handle_sse::<S>))
            .route("/messages", post(handle_legacy_post::<S>))
            .with_state(state)
    }

    /// Serve the transport on the given address
    pub async fn serve(self, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        tracing::info!("MCP HTTP transport listening on {}", addr);

        axum::serve(listener, self.into_router())
            .await
            .map_err(|e| Error::Transport(format!("Server error: {}", e)))?;

        Ok(())
    }
}

fn spawn_sweeper<S: Send + Sync + 'static>(state: Weak<AppState<S>>, ttl: Duration) {
    let period = (ttl / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            state.sessions.sweep(ttl).await;
        }
    });
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn is_initialize_request(payload: &Value) -> bool {
    payload.get("method").and_then(Value::as_str) == Some(methods::INITIALIZE)
}

fn reply_response(reply: Option<Value>) -> Response {
    match reply {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Handle POST requests (JSON-RPC messages from client)
async fn handle_post<S>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: String,
) -> Response
where
    S: Service<ServerRequest, Response = ServerResponse, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    let payload: Value = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => return Json(parse_error_reply(e)).into_response(),
    };

    if is_initialize_request(&payload) {
        let dispatched = state
            .service
            .dispatch(&BatchProcessor::default(), None, payload)
            .await;
        let mut response = reply_response(dispatched.reply);
        if let Some((session_id, _)) = dispatched.created_session
            && let Ok(value) = HeaderValue::from_str(&session_id)
        {
            response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
        }
        return response;
    }

    let Some(session_id) = header_str(&headers, MCP_SESSION_ID_HEADER) else {
        return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
    };
    let Some(session) = state.sessions.get(&session_id).await else {
        return (StatusCode::NOT_FOUND, "Session not found or expired").into_response();
    };

    match header_str(&headers, MCP_PROTOCOL_VERSION_HEADER) {
        Some(version) if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version.as_str()) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Unsupported protocol version: {}", version),
            )
                .into_response();
        }
        None if requires_version_header(&session.protocol_version) => {
            return (
                StatusCode::BAD_REQUEST,
                "Missing MCP-Protocol-Version header",
            )
                .into_response();
        }
        _ => {}
    }

    let processor = BatchProcessor::new(Some(session.protocol_version));
    let dispatched = state
        .service
        .dispatch(&processor, Some(session_id), payload)
        .await;
    reply_response(dispatched.reply)
}

/// Handle DELETE requests (session termination)
async fn handle_delete<S>(State(state): State<Arc<AppState<S>>>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_str(&headers, MCP_SESSION_ID_HEADER) else {
        return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
    };

    if state.sessions.delete(&session_id).await {
        tracing::info!(session_id = %session_id, "Session terminated");
        StatusCode::OK.into_response()
    } else {
        (StatusCode::NOT_FOUND, "Session not found").into_response()
    }
}

/// Open a legacy SSE stream
async fn handle_sse<S>(State(state): State<Arc<AppState<S>>>) -> Response
where
    S: Service<ServerRequest, Response = ServerResponse, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    let id = uuid::Uuid::new_v4().to_string();
    let (events, rx) = mpsc::channel::<Value>(DEFAULT_CHANNEL_CAPACITY);
    state.lock_legacy().insert(
        id.clone(),
        LegacyConnection {
            service: JsonRpcService::new(state.inner.clone()),
            events,
        },
    );
    tracing::info!(connection = %id, "Legacy SSE stream opened");

    let endpoint = Event::default()
        .event(SSE_ENDPOINT_EVENT)
        .data(format!("/messages?session_id={}", id));
    let guard = LegacyGuard {
        id,
        state: state.clone(),
    };
    let messages = ReceiverStream::new(rx).map(move |message| {
        let _connection = &guard;
        Ok::<_, Infallible>(
            Event::default()
                .event(SSE_MESSAGE_EVENT)
                .data(message.to_string()),
        )
    });
    let stream = tokio_stream::once(Ok::<_, Infallible>(endpoint)).chain(messages);

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
        .into_response()
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    session_id: String,
}

/// Accept a message for a legacy SSE stream; the reply goes out on the stream
async fn handle_legacy_post<S>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<MessagesQuery>,
    body: String,
) -> Response
where
    S: Service<ServerRequest, Response = ServerResponse, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    let Some(connection) = state.legacy_connection(&query.session_id) else {
        return (StatusCode::NOT_FOUND, "Unknown SSE connection").into_response();
    };

    let payload: Value = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            let _ = connection.events.send(parse_error_reply(e)).await;
            return StatusCode::ACCEPTED.into_response();
        }
    };

    tokio::spawn(async move {
        if let Some(reply) = connection.service.call_payload(payload).await
            && connection.events.send(reply).await.is_err()
        {
            tracing::debug!("Legacy SSE stream gone, dropping reply");
        }
    });
    StatusCode::ACCEPTED.into_response()
}
