//! HTTP client transport
//!
//! Every outbound message becomes one HTTP request to a single endpoint.
//! The response body, if any, is decoded and pushed to the inbound queue,
//! where the correlator matches it to its waiter by id. Requests run
//! concurrently, so responses may arrive out of order.
//!
//! Headers sent with every request:
//!
//! - `Content-Type: application/json` and `Accept: application/json`
//! - `Authorization: Bearer <token>` when a token is configured or found in
//!   [`MCP_BEARER_TOKEN`](super::BEARER_TOKEN_ENV), unless the caller
//!   supplied their own `Authorization` header
//! - `MCP-Protocol-Version` once a version that requires it was negotiated
//! - `Mcp-Session-Id` once the server has issued one

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue,
};
use reqwest::{Method, StatusCode, Url};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use super::sse::SseDecoder;
use super::{
    DEFAULT_CHANNEL_CAPACITY, MCP_PROTOCOL_VERSION_HEADER, MCP_SESSION_ID_HEADER, TokenHandle,
    Transport, TransportState, TransportStreams, begin_start,
};
use crate::codec;
use crate::error::{Error, JsonRpcError, Result};
use crate::protocol::{JsonRpcMessage, requires_version_header};

/// Client transport issuing one HTTP request per message.
///
/// # Example
///
/// ```rust,no_run
/// use mcp_conduit::{ClientConfig, McpClient};
/// use mcp_conduit::transport::HttpClientTransport;
///
/// # async fn run() -> mcp_conduit::Result<()> {
/// let transport = HttpClientTransport::new("http://127.0.0.1:3000/")
///     .bearer_token("secret")
///     .header("x-tenant", "acme");
/// let mut client = McpClient::connect(transport, ClientConfig::default()).await?;
/// client.initialize().await?;
/// # Ok(())
/// # }
/// ```
pub struct HttpClientTransport {
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    token: TokenHandle,
    protocol_version: Arc<RwLock<Option<String>>>,
    session_id: Arc<RwLock<Option<String>>>,
    state: TransportState,
    pump: Option<JoinHandle<()>>,
}

impl HttpClientTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::POST,
            headers: Vec::new(),
            timeout: None,
            token: TokenHandle::default(),
            protocol_version: Arc::new(RwLock::new(None)),
            session_id: Arc::new(RwLock::new(None)),
            state: TransportState::NotStarted,
            pump: None,
        }
    }

    /// HTTP method used for every request. Defaults to `POST`.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header sent with every request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer_token(self, token: impl Into<String>) -> Self {
        self.token.set(token);
        self
    }

    /// Per-request timeout enforced by the HTTP client.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Slot holding the bearer token, for refreshing it at runtime.
    pub fn token_handle(&self) -> TokenHandle {
        self.token.clone()
    }

    /// Session id issued by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        read_slot(&self.session_id)
    }
}

#[async_trait]
impl Transport for HttpClientTransport {
    async fn start(&mut self) -> Result<TransportStreams> {
        begin_start(&mut self.state)?;

        let poster = match HttpPoster::new(
            &self.headers,
            self.timeout,
            self.token.clone(),
            self.protocol_version.clone(),
            self.session_id.clone(),
        ) {
            Ok(poster) => poster,
            Err(e) => {
                self.state = TransportState::Stopped;
                return Err(e);
            }
        };
        let url = match Url::parse(&self.url) {
            Ok(url) => url,
            Err(e) => {
                self.state = TransportState::Stopped;
                return Err(Error::Connection(format!("Invalid URL {}: {}", self.url, e)));
            }
        };

        let (out_tx, mut out_rx) = mpsc::channel::<JsonRpcMessage>(DEFAULT_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let method = self.method.clone();
        let poster = Arc::new(poster);

        self.pump = Some(tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            while let Some(message) = out_rx.recv().await {
                let poster = poster.clone();
                let url = url.clone();
                let method = method.clone();
                let in_tx = in_tx.clone();
                in_flight.spawn(async move {
                    let outcome = poster.send(method, url, &message).await;
                    deliver(&message, outcome, &in_tx).await;
                });
                while in_flight.try_join_next().is_some() {}
            }
            while in_flight.join_next().await.is_some() {}
            tracing::debug!("HTTP outbound queue closed");
        }));

        tracing::info!(url = %self.url, method = %self.method, "HTTP transport started");
        self.state = TransportState::Running;
        Ok(TransportStreams {
            inbound: in_rx,
            outbound: out_tx,
        })
    }

    async fn stop(&mut self) {
        if self.state == TransportState::Stopped {
            return;
        }
        self.state = TransportState::Stopping;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.state = TransportState::Stopped;
        tracing::debug!(url = %self.url, "HTTP transport stopped");
    }

    fn set_protocol_version(&self, version: &str) {
        *self
            .protocol_version
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(version.to_string());
    }

    fn state(&self) -> TransportState {
        self.state
    }
}

impl Drop for HttpClientTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Request plumbing shared by the HTTP and SSE transports.
pub(crate) struct HttpPoster {
    client: reqwest::Client,
    headers: HeaderMap,
    token: TokenHandle,
    protocol_version: Arc<RwLock<Option<String>>>,
    session_id: Arc<RwLock<Option<String>>>,
}

impl HttpPoster {
    pub(crate) fn new(
        headers: &[(String, String)],
        timeout: Option<Duration>,
        token: TokenHandle,
        protocol_version: Arc<RwLock<Option<String>>>,
        session_id: Arc<RwLock<Option<String>>>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Connection(format!("Failed to build HTTP client: {}", e)))?;

        token.fill_from_env();

        Ok(Self {
            client,
            headers: header_map(headers)?,
            token,
            protocol_version,
            session_id,
        })
    }

    /// Headers for the next request: caller headers first, then the
    /// transport's own unless the caller already set them.
    pub(crate) fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("application/json"));

        if !headers.contains_key(AUTHORIZATION)
            && let Some(token) = self.token.get()
        {
            match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(e) => tracing::warn!(error = %e, "Bearer token is not a valid header value"),
            }
        }

        if let Some(version) = read_slot(&self.protocol_version)
            && requires_version_header(&version)
            && let Ok(value) = HeaderValue::from_str(&version)
        {
            headers.insert(MCP_PROTOCOL_VERSION_HEADER, value);
        }

        if let Some(session) = read_slot(&self.session_id)
            && let Ok(value) = HeaderValue::from_str(&session)
        {
            headers.insert(MCP_SESSION_ID_HEADER, value);
        }

        headers
    }

    /// Send one message and decode whatever the response body carries.
    ///
    /// `202 Accepted` and `204 No Content` yield no messages.
    pub(crate) async fn send(
        &self,
        method: Method,
        url: Url,
        message: &JsonRpcMessage,
    ) -> std::result::Result<Vec<JsonRpcMessage>, JsonRpcError> {
        let body = codec::encode(message).map_err(|e| e.to_jsonrpc())?;
        tracing::debug!(url = %url, method = ?message.method, id = ?message.id, "Sending HTTP request");

        let response = self
            .client
            .request(method, url)
            .headers(self.request_headers())
            .body(body)
            .send()
            .await
            .map_err(|e| JsonRpcError::connection_closed(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if let Some(session) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session_id.write().unwrap_or_else(|e| e.into_inner());
            if slot.as_deref() != Some(session) {
                tracing::debug!(session_id = %session, "Server issued session id");
                *slot = Some(session.to_string());
            }
        }

        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let text = response.text().await.map_err(|e| {
            JsonRpcError::connection_closed(format!("Failed to read response body: {}", e))
        })?;

        if !status.is_success() {
            tracing::warn!(status = %status, "HTTP request rejected");
            return Err(http_status_error(status, &text));
        }

        if is_event_stream {
            let mut decoder = SseDecoder::new();
            let mut events = decoder.feed(text.as_bytes());
            events.extend(decoder.finish());
            return Ok(events
                .into_iter()
                .filter(|event| event.event == "message")
                .flat_map(|event| decode_body(&event.data))
                .collect());
        }

        Ok(decode_body(&text))
    }
}

/// Push the outcome of one request to the inbound queue.
///
/// A failed request becomes an error response addressed to its id so the
/// waiter resolves; failed notifications are only logged.
pub(crate) async fn deliver(
    message: &JsonRpcMessage,
    outcome: std::result::Result<Vec<JsonRpcMessage>, JsonRpcError>,
    inbound: &mpsc::Sender<JsonRpcMessage>,
) {
    match outcome {
        Ok(replies) => {
            for reply in replies {
                if inbound.send(reply).await.is_err() {
                    tracing::debug!("Inbound queue closed, dropping reply");
                    return;
                }
            }
        }
        Err(error) => {
            tracing::warn!(code = error.code, error = %error.message, "HTTP exchange failed");
            if message.method.is_some()
                && let Some(id) = message.id.clone()
            {
                let _ = inbound
                    .send(JsonRpcMessage::error_response(id, error))
                    .await;
            }
        }
    }
}

fn decode_body(text: &str) -> Vec<JsonRpcMessage> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    match codec::decode_frame(text) {
        Ok(frame) => frame.into_messages(),
        Err(e) => {
            tracing::warn!(error = %e, "Discarding undecodable response body");
            Vec::new()
        }
    }
}

/// Error object for a non-2xx response. The status stays in the message so
/// handshake classification can recognise authorization failures.
fn http_status_error(status: StatusCode, body: &str) -> JsonRpcError {
    JsonRpcError::internal_error(format!("HTTP {}: {}", status.as_u16(), body.trim()))
        .with_data(json!({ "httpStatus": status.as_u16() }))
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Transport(format!("Invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Transport(format!("Invalid value for header {}: {}", name, e)))?;
        map.append(name, value);
    }
    Ok(map)
}

fn read_slot(slot: &RwLock<Option<String>>) -> Option<String> {
    slot.read().unwrap_or_else(|e| e.into_inner()).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poster(headers: &[(String, String)], token: Option<&str>) -> HttpPoster {
        let handle = TokenHandle::default();
        if let Some(token) = token {
            handle.set(token);
        }
        HttpPoster::new(
            headers,
            None,
            handle,
            Arc::new(RwLock::new(None)),
            Arc::new(RwLock::new(None)),
        )
        .unwrap()
    }

    #[test]
    fn test_default_headers() {
        let p = poster(&[], Some("tok"));
        let headers = p.request_headers();
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers[ACCEPT], "application/json");
        assert_eq!(headers[AUTHORIZATION], "Bearer tok");
        assert!(!headers.contains_key(MCP_PROTOCOL_VERSION_HEADER));
    }

    #[test]
    fn test_caller_authorization_not_overwritten() {
        let p = poster(
            &[("Authorization".to_string(), "Basic abc".to_string())],
            Some("tok"),
        );
        assert_eq!(p.request_headers()[AUTHORIZATION], "Basic abc");
    }

    #[test]
    fn test_version_header_only_after_cutoff() {
        let p = poster(&[], None);

        *p.protocol_version.write().unwrap() = Some("2025-03-26".to_string());
        assert!(!p.request_headers().contains_key(MCP_PROTOCOL_VERSION_HEADER));

        *p.protocol_version.write().unwrap() = Some("2025-06-18".to_string());
        assert_eq!(
            p.request_headers()[MCP_PROTOCOL_VERSION_HEADER],
            "2025-06-18"
        );
    }

    #[test]
    fn test_session_header_echoed() {
        let p = poster(&[], None);
        *p.session_id.write().unwrap() = Some("sess-1".to_string());
        assert_eq!(p.request_headers()[MCP_SESSION_ID_HEADER], "sess-1");
    }

    #[test]
    fn test_invalid_header_rejected() {
        let result = HttpPoster::new(
            &[("bad header".to_string(), "x".to_string())],
            None,
            TokenHandle::default(),
            Arc::new(RwLock::new(None)),
            Arc::new(RwLock::new(None)),
        );
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[test]
    fn test_status_error_mentions_code() {
        let err = http_status_error(StatusCode::UNAUTHORIZED, "invalid_token\n");
        assert_eq!(err.message, "HTTP 401: invalid_token");
        assert_eq!(err.data.unwrap()["httpStatus"], 401);
    }

    #[tokio::test]
    async fn test_failed_request_resolves_waiter() {
        let (tx, mut rx) = mpsc::channel(4);
        let request = JsonRpcMessage::request(7, "tools/list");
        deliver(
            &request,
            Err(JsonRpcError::connection_closed("refused")),
            &tx,
        )
        .await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.error.unwrap().code, -32000);

        let notification = JsonRpcMessage::notification("notifications/initialized");
        deliver(&notification, Err(JsonRpcError::internal_error("x")), &tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_request() {
        let mut transport = HttpClientTransport::new("http://127.0.0.1:9/");
        let mut streams = transport.start().await.unwrap();
        streams
            .outbound
            .send(JsonRpcMessage::request(1, "ping"))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(10), streams.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.error.unwrap().code, -32000);
        transport.stop().await;
        assert_eq!(transport.state(), TransportState::Stopped);
    }
}
