//! Minimal MCP server over stdio
//!
//! Answers `initialize` and `ping`, and exposes a few methods useful for
//! exercising clients:
//!
//! - `echo` returns its params
//! - `sleep` waits `{"ms": n}` milliseconds before answering
//! - `crash` exits the process without answering
//! - `tools/list` and `tools/call` with a single `echo` tool
//!
//! Logs go to stderr; set `RUST_LOG` to adjust the filter.
//!
//! ```bash
//! echo '{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26","capabilities":{},"clientInfo":{"name":"test","version":"1.0"}}}' \
//!   | cargo run --bin mcp-echo-server
//! ```

use std::time::Duration;

use mcp_conduit::transport::StdioTransport;
use mcp_conduit::{BoxError, JsonRpcError, McpServer, McpTracingLayer};
use serde_json::{Value, json};
use tower::ServiceBuilder;

async fn echo(params: Option<Value>) -> Result<Value, JsonRpcError> {
    Ok(params.unwrap_or_else(|| json!({})))
}

async fn sleep(params: Option<Value>) -> Result<Value, JsonRpcError> {
    let ms = params
        .as_ref()
        .and_then(|p| p.get("ms"))
        .and_then(Value::as_u64)
        .ok_or_else(|| JsonRpcError::invalid_params("Expected {\"ms\": <integer>}"))?;
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(json!({ "slept": ms }))
}

async fn crash(_params: Option<Value>) -> Result<Value, JsonRpcError> {
    tracing::warn!("Exiting on request");
    std::process::exit(3)
}

async fn list_tools(_params: Option<Value>) -> Result<Value, JsonRpcError> {
    Ok(json!({
        "tools": [{
            "name": "echo",
            "description": "Echo the given text",
            "inputSchema": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }
        }]
    }))
}

async fn call_tool(params: Option<Value>) -> Result<Value, JsonRpcError> {
    let params = params.unwrap_or(Value::Null);
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    if name != "echo" {
        return Err(JsonRpcError::invalid_params(format!("Unknown tool: {}", name)));
    }
    let text = params
        .pointer("/arguments/text")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::invalid_params("Missing argument: text"))?;
    Ok(json!({
        "content": [{ "type": "text", "text": text }],
        "isError": false
    }))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Logs must stay off stdout, which carries the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_conduit=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let server = McpServer::new("mcp-echo-server", env!("CARGO_PKG_VERSION"))
        .instructions("Echoes requests back; useful for testing MCP clients.")
        .capabilities(json!({ "tools": {} }))
        .method("echo", echo)
        .method("sleep", sleep)
        .method("crash", crash)
        .method("tools/list", list_tools)
        .method("tools/call", call_tool);

    let service = ServiceBuilder::new()
        .layer(McpTracingLayer::new())
        .service(server);

    StdioTransport::new(service).run().await?;
    Ok(())
}
