//! Client tests against a real child process
//!
//! Spawns the `mcp-echo-server` binary and talks to it over its stdio.

use std::time::{Duration, Instant};

use mcp_conduit::transport::ChildProcessTransport;
use mcp_conduit::{ClientConfig, McpClient, TransportState};
use serde_json::json;

fn echo_server() -> ChildProcessTransport {
    ChildProcessTransport::new(env!("CARGO_BIN_EXE_mcp-echo-server"))
        .env("RUST_LOG", "warn")
        .log_stderr()
}

async fn connect() -> McpClient {
    McpClient::connect(echo_server(), ClientConfig::default())
        .await
        .expect("echo server spawns")
}

#[tokio::test]
async fn test_handshake_and_tools() {
    let mut client = connect().await;

    let result = client.initialize().await.unwrap();
    assert_eq!(result.server_info.name, "mcp-echo-server");
    assert_eq!(result.protocol_version, "2025-06-18");

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools["tools"][0]["name"], "echo");

    let reply = client
        .call_tool("echo", json!({"text": "hello"}))
        .await
        .unwrap();
    assert_eq!(reply["content"][0]["text"], "hello");

    client.close().await;
    assert_eq!(client.transport_state(), TransportState::Stopped);
}

#[tokio::test]
async fn test_concurrent_requests_over_stdio() {
    let mut client = connect().await;
    client.initialize().await.unwrap();
    let handle = client.handle();

    let slow = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.request("sleep", Some(json!({"ms": 300}))).await })
    };
    let fast = handle.request("echo", Some(json!({"n": 1}))).await.unwrap();
    assert_eq!(fast, json!({"n": 1}));
    assert_eq!(slow.await.unwrap().unwrap(), json!({"slept": 300}));

    client.close().await;
}

#[tokio::test]
async fn test_stop_fails_unanswered_requests() {
    let mut client = connect().await;
    client.initialize().await.unwrap();
    let handle = client.handle();

    let pending: Vec<_> = (0..3)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request("sleep", Some(json!({"ms": 60_000}))).await })
        })
        .collect();
    while client.pending_requests() < 3 {
        tokio::task::yield_now().await;
    }

    let started = Instant::now();
    client.close().await;
    for task in pending {
        let err = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("request resolves after stop")
            .unwrap()
            .unwrap_err();
        assert!(err.is_connection());
    }
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_child_exit_fails_pending_requests() {
    let mut client = connect().await;
    client.initialize().await.unwrap();
    let handle = client.handle();

    let waiting = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.request("sleep", Some(json!({"ms": 60_000}))).await })
    };
    while client.pending_requests() < 1 {
        tokio::task::yield_now().await;
    }

    let crash = tokio::time::timeout(Duration::from_secs(5), client.request("crash", None))
        .await
        .expect("crash request resolves");
    assert!(crash.unwrap_err().is_connection());

    let err = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("pending request resolves")
        .unwrap()
        .unwrap_err();
    assert!(err.is_connection());

    client.close().await;
}
