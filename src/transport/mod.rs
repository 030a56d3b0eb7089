//! MCP transport implementations
//!
//! Client transports implement [`Transport`]: `start` hands back a pair of
//! message queues and spawns whatever background pumps the channel needs;
//! `stop` tears all of it down.
//!
//! - `childproc` - spawn a server as a child process and speak over its stdio (requires `childproc` feature)
//! - `http_client` - one HTTP request per outbound message (requires `http` feature)
//! - `sse` - legacy Server-Sent-Events transport (requires `http` feature)
//! - `channel` - in-memory pair for in-process peers and tests
//!
//! Server-side loops live next to them:
//!
//! - `stdio` - serve an [`McpServer`](crate::McpServer) over stdin/stdout
//! - `http` - axum endpoint with session headers and a legacy SSE endpoint (requires `http-server` feature)
//!
//! ## Synchronization
//!
//! - **Queues**: inbound and outbound messages travel over bounded `mpsc`
//!   channels; dropping the inbound sender is how a transport signals that the
//!   connection is gone.
//! - **Background tasks**: every pump is a spawned task whose handle the
//!   transport owns and aborts in `stop` and on drop.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::JsonRpcMessage;

pub mod channel;
pub mod stdio;

#[cfg(feature = "childproc")]
pub mod childproc;

#[cfg(feature = "http")]
pub mod http_client;

#[cfg(feature = "http")]
pub mod sse;

#[cfg(feature = "http-server")]
pub mod http;

pub use channel::{ChannelPeer, ChannelTransport};
pub use stdio::StdioTransport;

#[cfg(feature = "childproc")]
pub use childproc::ChildProcessTransport;

#[cfg(feature = "http")]
pub use http_client::HttpClientTransport;

#[cfg(feature = "http")]
pub use sse::{SseDecoder, SseEvent, SseTransport};

#[cfg(feature = "http-server")]
pub use http::HttpTransport;

/// Capacity of the inbound and outbound queues created by transports.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Header carrying the negotiated protocol version on HTTP requests
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Header carrying the streamable-HTTP session id
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Environment variable consulted for a bearer token when none is configured.
pub const BEARER_TOKEN_ENV: &str = "MCP_BEARER_TOKEN";

/// Lifecycle of a client transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// The message queues of a started transport.
///
/// `inbound` yields every message the peer sends, in arrival order, and ends
/// when the connection is gone. Messages pushed to `outbound` are delivered
/// in FIFO order.
#[derive(Debug)]
pub struct TransportStreams {
    pub inbound: mpsc::Receiver<JsonRpcMessage>,
    pub outbound: mpsc::Sender<JsonRpcMessage>,
}

/// A bidirectional JSON-RPC channel to an MCP peer.
#[async_trait]
pub trait Transport: Send {
    /// Establish the channel and start its background pumps.
    ///
    /// Can be called once; fails with [`Error::Connection`] if the channel
    /// cannot be established.
    async fn start(&mut self) -> Result<TransportStreams>;

    /// Release the channel and every background task. Never fails.
    async fn stop(&mut self);

    /// Tell the transport which protocol version was negotiated.
    fn set_protocol_version(&self, _version: &str) {}

    fn state(&self) -> TransportState;
}

/// Move `state` from `NotStarted` to `Starting`, refusing a second start.
pub(crate) fn begin_start(state: &mut TransportState) -> Result<()> {
    match *state {
        TransportState::NotStarted => {
            *state = TransportState::Starting;
            Ok(())
        }
        other => Err(Error::Connection(format!(
            "Transport cannot be started from state {:?}",
            other
        ))),
    }
}

/// Bearer token from the environment, ignoring empty values.
#[cfg(feature = "http")]
pub(crate) fn bearer_token_from_env() -> Option<String> {
    std::env::var(BEARER_TOKEN_ENV)
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Shared slot holding the bearer token of an HTTP-based transport.
///
/// Requests read the slot when they are sent, so a token set after a
/// [`Retryable`](Error::Retryable) failure applies to the retry.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct TokenHandle(std::sync::Arc<std::sync::RwLock<Option<String>>>);

#[cfg(feature = "http")]
impl TokenHandle {
    pub fn set(&self, token: impl Into<String>) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Fill an empty slot from [`BEARER_TOKEN_ENV`].
    pub(crate) fn fill_from_env(&self) {
        let mut slot = self.0.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = bearer_token_from_env();
        }
    }
}
