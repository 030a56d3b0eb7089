//! MCP Client implementation
//!
//! [`McpClient`] ties a [`Transport`] to a [`Correlator`] and the
//! [`Initializer`] handshake. A background router task feeds every inbound
//! message to the correlator; when the transport's inbound stream ends, every
//! pending request fails with a connection error.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp_conduit::{ClientConfig, McpClient};
//! use mcp_conduit::transport::ChildProcessTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Connect to an MCP server via stdio
//!     let transport = ChildProcessTransport::new("my-mcp-server").arg("--flag");
//!     let mut client = McpClient::connect(transport, ClientConfig::default()).await?;
//!
//!     // Initialize the connection
//!     let server = client.initialize().await?;
//!     println!("Connected to: {}", server.server_info.name);
//!
//!     // List available tools
//!     let tools = client.list_tools().await?;
//!     println!("Tools: {}", tools);
//!
//!     // Call a tool
//!     let result = client.call_tool("my-tool", serde_json::json!({"arg": "value"})).await?;
//!     println!("Result: {:?}", result);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::correlator::{Correlator, DEFAULT_NOTIFICATION_CAPACITY};
use crate::error::{Error, Result};
use crate::handshake::{DEFAULT_INIT_TIMEOUT, InitializeState, Initializer};
use crate::protocol::{
    Implementation, InitializeResult, JsonRpcMessage, SUPPORTED_PROTOCOL_VERSIONS, methods,
};
use crate::transport::{Transport, TransportState};

/// Default bound on ordinary requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    request_timeout: Duration,
    init_timeout: Duration,
    protocol_versions: Vec<String>,
    client_info: Implementation,
    capabilities: Value,
    require_proposed_version: bool,
    notification_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            protocol_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            client_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            capabilities: json!({}),
            require_proposed_version: false,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Acceptable protocol versions, most preferred first
    pub fn protocol_versions<I, V>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.protocol_versions = versions.into_iter().map(Into::into).collect();
        self
    }

    pub fn client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = Implementation::new(name, version);
        self
    }

    pub fn capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Fail `initialize` when the server answers with a version this client
    /// did not propose. Off by default: any well-formed answer is accepted.
    pub fn require_proposed_version(mut self, require: bool) -> Self {
        self.require_proposed_version = require;
        self
    }

    /// Capacity of the notification channel; overflow is dropped.
    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }
}

/// MCP Client for connecting to MCP servers
pub struct McpClient {
    transport: Box<dyn Transport>,
    correlator: Arc<Correlator>,
    router: Option<JoinHandle<()>>,
    notifications: Option<mpsc::Receiver<JsonRpcMessage>>,
    config: ClientConfig,
    initializer: Initializer,
    server_info: Option<InitializeResult>,
    closed: bool,
}

impl McpClient {
    /// Start `transport` and begin routing its inbound messages.
    ///
    /// If the transport fails to start it is stopped again before the error
    /// is returned.
    pub async fn connect<T>(transport: T, config: ClientConfig) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let mut transport: Box<dyn Transport> = Box::new(transport);
        let streams = match transport.start().await {
            Ok(streams) => streams,
            Err(e) => {
                tracing::warn!(error = %e, "Transport failed to start");
                transport.stop().await;
                return Err(e);
            }
        };

        let (correlator, notifications) =
            Correlator::new(streams.outbound, config.notification_capacity);
        let correlator = Arc::new(correlator);

        let mut inbound = streams.inbound;
        let routing = correlator.clone();
        let router = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                routing.route(message);
            }
            tracing::debug!("Inbound stream ended");
            routing.fail_all("Transport closed");
        });

        let initializer = Initializer::new(config.client_info.clone())
            .versions(config.protocol_versions.clone())
            .capabilities(config.capabilities.clone())
            .timeout(config.init_timeout);

        Ok(Self {
            transport,
            correlator,
            router: Some(router),
            notifications: Some(notifications),
            config,
            initializer,
            server_info: None,
            closed: false,
        })
    }

    /// Perform the `initialize` handshake.
    pub async fn initialize(&mut self) -> Result<InitializeResult> {
        let result = self.initializer.request(&self.correlator).await?;

        let proposed = self.initializer.proposed_versions();
        if self.config.require_proposed_version
            && !proposed.iter().any(|v| *v == result.protocol_version)
        {
            let err = Error::VersionMismatch {
                requested: self.initializer.preferred_version().to_string(),
                supported: vec![result.protocol_version.clone()],
            };
            tracing::warn!(error = %err, "Server chose a version outside the proposed list");
            self.initializer.fail(err.to_string());
            return Err(err);
        }

        // Before `initialized` so HTTP sends the version header with it.
        self.transport.set_protocol_version(&result.protocol_version);
        self.initializer.confirm(&self.correlator, &result).await?;
        self.server_info = Some(result.clone());
        Ok(result)
    }

    /// The server's `initialize` answer, once the handshake has completed.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.as_ref()
    }

    pub fn negotiated_version(&self) -> Option<&str> {
        match self.initializer.state() {
            InitializeState::Negotiated(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.negotiated_version().is_some()
    }

    pub fn handshake_state(&self) -> &InitializeState {
        self.initializer.state()
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    /// Take the stream of server notifications and server-initiated requests.
    pub fn take_notifications(&mut self) -> Option<mpsc::Receiver<JsonRpcMessage>> {
        self.notifications.take()
    }

    /// A cloneable handle for issuing requests from other tasks.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            correlator: self.correlator.clone(),
            timeout: self.config.request_timeout,
        }
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Send a raw request with the configured timeout
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.correlator
            .send_request(method, params, self.config.request_timeout)
            .await
    }

    /// Send a raw request with an explicit timeout
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.correlator.send_request(method, params, timeout).await
    }

    /// Send a notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.correlator.send_notification(method, params).await
    }

    /// Ping the server
    pub async fn ping(&self) -> Result<()> {
        self.request(methods::PING, None).await?;
        Ok(())
    }

    /// List available tools
    pub async fn list_tools(&self) -> Result<Value> {
        self.ensure_initialized()?;
        self.request(methods::TOOLS_LIST, Some(json!({}))).await
    }

    /// Call a tool
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.ensure_initialized()?;
        self.request(
            methods::TOOLS_CALL,
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// List available resources
    pub async fn list_resources(&self) -> Result<Value> {
        self.ensure_initialized()?;
        self.request(methods::RESOURCES_LIST, Some(json!({}))).await
    }

    /// Read a resource
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.ensure_initialized()?;
        self.request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await
    }

    /// List available prompts
    pub async fn list_prompts(&self) -> Result<Value> {
        self.ensure_initialized()?;
        self.request(methods::PROMPTS_LIST, Some(json!({}))).await
    }

    /// Get a prompt
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<Value> {
        self.ensure_initialized()?;
        self.request(
            methods::PROMPTS_GET,
            Some(json!({ "name": name, "arguments": arguments.unwrap_or_default() })),
        )
        .await
    }

    /// Stop the transport and fail every pending request. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!("Closing client");
        self.transport.stop().await;
        self.correlator.fail_all("Transport stopped");
        if let Some(router) = self.router.take() {
            router.abort();
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::Transport("Client not initialized".to_string()));
        }
        Ok(())
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if !self.closed {
            self.correlator.fail_all("Client dropped");
        }
        if let Some(router) = self.router.take() {
            router.abort();
        }
    }
}

/// Cheap, cloneable handle for issuing requests concurrently.
#[derive(Clone)]
pub struct ClientHandle {
    correlator: Arc<Correlator>,
    timeout: Duration,
}

impl ClientHandle {
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.correlator
            .send_request(method, params, self.timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.correlator.send_request(method, params, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.correlator.send_notification(method, params).await
    }

    pub fn is_closed(&self) -> bool {
        self.correlator.is_closed()
    }
}
