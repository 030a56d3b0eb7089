//! Legacy Server-Sent-Events transport
//!
//! The client opens a long-lived `GET` stream. The server's first `endpoint`
//! event names the URL that outbound messages must be `POST`ed to; replies
//! arrive either in the `POST` response body or later as `message` events on
//! the stream. Both paths feed the same inbound queue.
//!
//! Messages queued before the endpoint is known wait for it, up to the
//! startup timeout.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::{Method, Url};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use super::http_client::{HttpPoster, deliver};
use super::{
    DEFAULT_CHANNEL_CAPACITY, TokenHandle, Transport, TransportState, TransportStreams,
    begin_start,
};
use crate::codec;
use crate::error::{Error, JsonRpcError, Result};
use crate::protocol::JsonRpcMessage;

/// Default wait for the server's `endpoint` event.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type, `message` when the server did not name one
    pub event: String,
    /// `data:` lines joined with `\n`
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` decoder.
///
/// Chunks may split lines or UTF-8 sequences anywhere; incomplete input is
/// buffered until the rest arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if let Some(event) = self.line(line.trim_end_matches('\r')) {
                events.push(event);
            }
        }
        events
    }

    /// Flush an event left unterminated at end of stream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(event) = self.line(line.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.clone(),
        })
    }
}

/// Resolve the data of an `endpoint` event against the stream URL.
///
/// Accepts absolute URLs, absolute or relative paths, quoted values and a
/// bare `session_id=...` query. The result must share the stream's origin.
pub fn normalize_endpoint(base: &Url, raw: &str) -> Result<Url> {
    let trimmed = raw.trim().trim_matches('"').trim();
    if trimmed.is_empty() {
        return Err(Error::Connection("Empty SSE endpoint".to_string()));
    }

    let candidate = if trimmed.starts_with("session_id=") {
        format!("?{}", trimmed)
    } else {
        trimmed.to_string()
    };

    let url = match Url::parse(&candidate) {
        Ok(url) => url,
        Err(_) => base
            .join(&candidate)
            .map_err(|e| Error::Connection(format!("Invalid SSE endpoint {}: {}", raw, e)))?,
    };

    if url.origin() != base.origin() {
        return Err(Error::Connection(format!(
            "SSE endpoint origin does not match stream: {}",
            url
        )));
    }
    Ok(url)
}

/// Client transport for servers speaking the legacy SSE binding.
///
/// # Example
///
/// ```rust,no_run
/// use mcp_conduit::{ClientConfig, McpClient};
/// use mcp_conduit::transport::SseTransport;
///
/// # async fn run() -> mcp_conduit::Result<()> {
/// let transport = SseTransport::new("http://127.0.0.1:3000/sse");
/// let mut client = McpClient::connect(transport, ClientConfig::default()).await?;
/// client.initialize().await?;
/// # Ok(())
/// # }
/// ```
pub struct SseTransport {
    url: String,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    startup_timeout: Duration,
    token: TokenHandle,
    state: TransportState,
    tasks: Vec<JoinHandle<()>>,
}

impl SseTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            timeout: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            token: TokenHandle::default(),
            state: TransportState::NotStarted,
            tasks: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer_token(self, token: impl Into<String>) -> Self {
        self.token.set(token);
        self
    }

    /// Timeout for each `POST`. The event stream itself is not bounded.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// How long outbound messages wait for the `endpoint` event.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn token_handle(&self) -> TokenHandle {
        self.token.clone()
    }

    async fn open(&mut self) -> Result<TransportStreams> {
        let url = Url::parse(&self.url)
            .map_err(|e| Error::Connection(format!("Invalid URL {}: {}", self.url, e)))?;
        // The stream must outlive any per-request timeout, so it gets its own
        // unbounded client and the poster's is used for POSTs only.
        let poster = Arc::new(HttpPoster::new(
            &self.headers,
            self.timeout,
            self.token.clone(),
            Arc::new(RwLock::new(None)),
            Arc::new(RwLock::new(None)),
        )?);
        let stream_client = reqwest::Client::new();

        let mut headers = poster.request_headers();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let response = stream_client
            .get(url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("SSE connection failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Connection(format!(
                "SSE handshake failed: HTTP {}",
                response.status().as_u16()
            )));
        }
        tracing::info!(url = %url, "SSE stream opened");

        let (endpoint_tx, endpoint_rx) = watch::channel(None::<Url>);
        let (in_tx, in_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        // The writer only holds a weak sender: inbound ends with the stream.
        let weak_in = in_tx.downgrade();
        let reader = tokio::spawn(read_events(response.bytes_stream(), url, endpoint_tx, in_tx));
        let writer = tokio::spawn(write_messages(
            poster,
            out_rx,
            endpoint_rx,
            weak_in,
            self.startup_timeout,
        ));
        self.tasks = vec![reader, writer];

        Ok(TransportStreams {
            inbound: in_rx,
            outbound: out_tx,
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&mut self) -> Result<TransportStreams> {
        begin_start(&mut self.state)?;
        match self.open().await {
            Ok(streams) => {
                self.state = TransportState::Running;
                Ok(streams)
            }
            Err(e) => {
                self.state = TransportState::Stopped;
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        if self.state == TransportState::Stopped {
            return;
        }
        self.state = TransportState::Stopping;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.state = TransportState::Stopped;
        tracing::debug!(url = %self.url, "SSE transport stopped");
    }

    fn state(&self) -> TransportState {
        self.state
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn read_events<S, B, E>(
    stream: S,
    base: Url,
    endpoint: watch::Sender<Option<Url>>,
    inbound: mpsc::Sender<JsonRpcMessage>,
) where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "SSE stream failed");
                break;
            }
        };
        for event in decoder.feed(chunk.as_ref()) {
            if !handle_event(event, &base, &endpoint, &inbound).await {
                return;
            }
        }
    }
    // A last event may arrive without its terminating blank line.
    if let Some(event) = decoder.finish() {
        handle_event(event, &base, &endpoint, &inbound).await;
    }
    tracing::info!("SSE stream ended");
}

/// Returns `false` once nobody is reading inbound messages.
async fn handle_event(
    event: SseEvent,
    base: &Url,
    endpoint: &watch::Sender<Option<Url>>,
    inbound: &mpsc::Sender<JsonRpcMessage>,
) -> bool {
    match event.event.as_str() {
        "endpoint" => match normalize_endpoint(base, &event.data) {
            Ok(url) => {
                tracing::debug!(endpoint = %url, "SSE endpoint discovered");
                endpoint.send_replace(Some(url));
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring SSE endpoint event"),
        },
        "message" => match codec::decode_frame(&event.data) {
            Ok(frame) => {
                for message in frame.into_messages() {
                    if inbound.send(message).await.is_err() {
                        return false;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Discarding undecodable SSE message"),
        },
        other => tracing::debug!(event = %other, "Ignoring SSE event"),
    }
    true
}

async fn write_messages(
    poster: Arc<HttpPoster>,
    mut outbound: mpsc::Receiver<JsonRpcMessage>,
    mut endpoint: watch::Receiver<Option<Url>>,
    inbound: mpsc::WeakSender<JsonRpcMessage>,
    startup_timeout: Duration,
) {
    let mut in_flight = JoinSet::new();
    while let Some(message) = outbound.recv().await {
        let target = wait_for_endpoint(&mut endpoint, startup_timeout).await;
        let Some(inbound) = inbound.upgrade() else {
            tracing::debug!("Inbound queue closed, dropping outbound message");
            continue;
        };
        let Some(target) = target else {
            let error = JsonRpcError::connection_closed("SSE endpoint was not received");
            deliver(&message, Err(error), &inbound).await;
            continue;
        };

        let poster = poster.clone();
        in_flight.spawn(async move {
            let outcome = poster.send(Method::POST, target, &message).await;
            deliver(&message, outcome, &inbound).await;
        });
        while in_flight.try_join_next().is_some() {}
    }
    while in_flight.join_next().await.is_some() {}
}

async fn wait_for_endpoint(
    endpoint: &mut watch::Receiver<Option<Url>>,
    limit: Duration,
) -> Option<Url> {
    match tokio::time::timeout(limit, endpoint.wait_for(Option::is_some)).await {
        Ok(Ok(url)) => url.clone(),
        _ => None,
    }
}
