//! Stdio transport for MCP servers
//!
//! Reads JSON-RPC messages from stdin and writes responses to stdout, one
//! JSON value per line. Messages are handled concurrently, so a slow request
//! does not hold up the ones behind it and responses may leave out of order.

use std::convert::Infallible;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tower_service::Service;

use super::DEFAULT_CHANNEL_CAPACITY;
use crate::codec;
use crate::error::{Error, Result};
use crate::jsonrpc::{JsonRpcService, parse_error_reply};
use crate::server::{McpServer, ServerRequest, ServerResponse};

/// Stdio transport for MCP servers
///
/// # Example
///
/// ```rust,no_run
/// use mcp_conduit::McpServer;
/// use mcp_conduit::transport::StdioTransport;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = McpServer::new("my-server", "1.0.0");
///
///     let mut transport = StdioTransport::new(server);
///     transport.run().await?;
///     Ok(())
/// }
/// ```
pub struct StdioTransport<S = McpServer> {
    service: JsonRpcService<S>,
}

impl<S> StdioTransport<S>
where
    S: Service<ServerRequest, Response = ServerResponse, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    /// Create a new stdio transport serving `service`
    pub fn new(service: S) -> Self {
        Self {
            service: JsonRpcService::new(service),
        }
    }

    /// Session created by the client's `initialize`, once it has happened.
    pub fn session_id(&self) -> Option<String> {
        self.service.session_id()
    }

    /// Run the transport on the process's stdin/stdout until EOF or error
    pub async fn run(&mut self) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Run the transport on an arbitrary reader/writer pair.
    ///
    /// Returns after the reader hits EOF and every in-flight message has
    /// been answered.
    pub async fn serve<R, W>(&mut self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel::<Value>(DEFAULT_CHANNEL_CAPACITY);
        let writer_task = tokio::spawn(write_replies(writer, reply_rx));
        let mut in_flight = JoinSet::new();

        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        tracing::info!("Stdio transport started, waiting for input");

        let result = loop {
            line.clear();
            let bytes_read = match reader.read_until(b'\n', &mut line).await {
                Ok(n) => n,
                Err(e) => {
                    break Err(Error::Transport(format!("Failed to read from stdin: {}", e)));
                }
            };

            if bytes_read == 0 {
                tracing::info!("Stdin closed, shutting down");
                break Ok(());
            }

            let trimmed = codec::trim_ascii(&line);
            if trimmed.is_empty() {
                continue;
            }

            tracing::debug!(input = %String::from_utf8_lossy(trimmed), "Received message");

            // Invalid UTF-8 surfaces here as a JSON syntax error.
            let payload: Value = match serde_json::from_slice(trimmed) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "Received invalid JSON");
                    let _ = reply_tx.send(parse_error_reply(e)).await;
                    continue;
                }
            };

            let service = self.service.clone();
            let reply_tx = reply_tx.clone();
            in_flight.spawn(async move {
                if let Some(reply) = service.call_payload(payload).await {
                    let _ = reply_tx.send(reply).await;
                }
            });

            // Reap finished handlers so the set does not grow without bound.
            while in_flight.try_join_next().is_some() {}
        };

        while in_flight.join_next().await.is_some() {}
        drop(reply_tx);
        if let Err(e) = writer_task.await {
            tracing::error!(error = %e, "Stdout writer task failed");
        }
        result
    }
}

async fn write_replies<W>(mut writer: W, mut replies: mpsc::Receiver<Value>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(reply) = replies.recv().await {
        let mut bytes = match serde_json::to_vec(&reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize response");
                continue;
            }
        };
        bytes.push(b'\n');
        tracing::debug!(output = %String::from_utf8_lossy(&bytes).trim_end(), "Sending response");

        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            tracing::error!(error = %e, "Failed to write to stdout");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    fn create_test_server() -> McpServer {
        McpServer::new("stdio-test", "1.0.0")
            .method("echo", |params| async move { Ok(params.unwrap_or(json!({}))) })
            .method("sleep", |params| async move {
                let ms = params
                    .as_ref()
                    .and_then(|p| p.get("ms"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept": ms }))
            })
    }

    async fn run_lines(lines: &[&str]) -> (Vec<Value>, Option<String>) {
        let mut input = Vec::new();
        for line in lines {
            input.extend_from_slice(line.as_bytes());
            input.push(b'\n');
        }
        run_input(&input).await
    }

    async fn run_input(input: &[u8]) -> (Vec<Value>, Option<String>) {
        let (client, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, mut client_write) = tokio::io::split(client);

        let mut transport = StdioTransport::new(create_test_server());
        let server = tokio::spawn(async move {
            transport.serve(server_read, server_write).await.unwrap();
            transport.session_id()
        });

        client_write.write_all(input).await.unwrap();
        client_write.shutdown().await.unwrap();
        drop(client_write);

        let session = server.await.unwrap();
        let mut replies = Vec::new();
        let mut reader = tokio::io::BufReader::new(client_read).lines();
        while let Some(line) = reader.next_line().await.unwrap() {
            replies.push(serde_json::from_str(&line).unwrap());
        }
        (replies, session)
    }

    #[tokio::test]
    async fn test_initialize_and_echo() {
        let (replies, session) = run_lines(&[
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-06-18","capabilities":{},"clientInfo":{"name":"t","version":"1"}}}"#,
        ])
        .await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["result"]["protocolVersion"], "2025-06-18");
        assert!(session.is_some());
    }

    #[tokio::test]
    async fn test_parse_error_and_notification() {
        let (replies, _) = run_lines(&[
            "{not json",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "",
        ])
        .await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["error"]["code"], -32700);
        assert!(replies[0]["id"].is_null());
    }

    #[tokio::test]
    async fn test_slow_request_does_not_block_others() {
        let (replies, _) = run_lines(&[
            r#"{"jsonrpc":"2.0","id":"slow","method":"sleep","params":{"ms":200}}"#,
            r#"{"jsonrpc":"2.0","id":"fast","method":"echo","params":{"v":1}}"#,
        ])
        .await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], "fast");
        assert_eq!(replies[1]["id"], "slow");
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_keeps_serving() {
        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(br#"{"jsonrpc":"2.0","id":7,"method":"echo","params":{"v":2}}"#);
        input.push(b'\n');

        let (replies, _) = run_input(&input).await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["error"]["code"], -32700);
        assert_eq!(replies[1]["id"], 7);
        assert_eq!(replies[1]["result"], json!({"v": 2}));
    }
}
