//! # mcp-conduit
//!
//! Model Context Protocol (MCP) client transports, request correlation and a
//! minimal server, built on tokio and [Tower](https://docs.rs/tower).
//!
//! The client side moves JSON-RPC 2.0 messages over a [`Transport`]
//! (a spawned child process, HTTP, or legacy SSE), matches responses to
//! requests by id, and runs the `initialize` handshake. The server side is a
//! tower [`Service`](tower_service::Service) that the stdio loop and the axum
//! HTTP endpoint can serve, with sessions tracked in a [`SessionRegistry`].
//!
//! ## Quick Start: Client
//!
//! ```rust,no_run
//! use mcp_conduit::{ClientConfig, McpClient};
//! use mcp_conduit::transport::ChildProcessTransport;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> mcp_conduit::Result<()> {
//!     let transport = ChildProcessTransport::new("my-mcp-server");
//!     let config = ClientConfig::default().request_timeout(Duration::from_secs(10));
//!     let mut client = McpClient::connect(transport, config).await?;
//!
//!     let server = client.initialize().await?;
//!     println!("Negotiated {}", server.protocol_version);
//!
//!     let tools = client.list_tools().await?;
//!     println!("{tools}");
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Quick Start: Server
//!
//! ```rust,no_run
//! use mcp_conduit::{McpServer, McpTracingLayer};
//! use mcp_conduit::transport::StdioTransport;
//! use serde_json::json;
//! use tower::ServiceBuilder;
//!
//! #[tokio::main]
//! async fn main() -> mcp_conduit::Result<()> {
//!     let server = McpServer::new("my-server", "1.0.0")
//!         .method("echo", |params| async move { Ok(params.unwrap_or(json!({}))) });
//!
//!     let service = ServiceBuilder::new()
//!         .layer(McpTracingLayer::new())
//!         .service(server);
//!
//!     StdioTransport::new(service).run().await
//! }
//! ```
//!
//! ## Errors
//!
//! Every failure is an [`Error`]. Callers that refresh credentials can branch
//! on [`Error::is_retryable`]; a version disagreement surfaces as
//! [`Error::VersionMismatch`] and a dead channel as [`Error::Connection`].
//!
//! ## Features
//!
//! - `childproc` (default): [`ChildProcessTransport`](transport::ChildProcessTransport)
//! - `http` (default): [`HttpClientTransport`](transport::HttpClientTransport) and
//!   [`SseTransport`](transport::SseTransport)
//! - `http-server`: [`HttpTransport`](transport::HttpTransport), an axum endpoint

pub mod batch;
pub mod client;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod handshake;
pub mod jsonrpc;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tracing_layer;
pub mod transport;

pub use batch::BatchProcessor;
pub use client::{ClientConfig, ClientHandle, McpClient};
pub use codec::Frame;
pub use config::{ServerEntry, ServersConfig};
pub use correlator::Correlator;
pub use error::{BoxError, Error, ErrorCode, JsonRpcError, Result};
pub use handshake::{InitializeState, Initializer};
pub use jsonrpc::{JsonRpcLayer, JsonRpcService};
pub use protocol::{
    Implementation, InitializeParams, InitializeResult, JsonRpcMessage, LATEST_PROTOCOL_VERSION,
    MessageKind, ProtocolVersion, RequestId, SUPPORTED_PROTOCOL_VERSIONS, negotiate,
};
pub use server::{McpServer, ServerRequest, ServerResponse};
pub use session::{SessionInfo, SessionRegistry};
pub use tracing_layer::McpTracingLayer;
pub use transport::{Transport, TransportState, TransportStreams};
