//! The `initialize` handshake and version negotiation
//!
//! [`Initializer`] sends exactly one `initialize` request carrying the
//! client's most-preferred protocol version, accepts whatever version the
//! server answers with, and then emits `notifications/initialized`.
//!
//! Failures are never swallowed. Error responses are classified so callers
//! can branch on them:
//!
//! | Response looks like | Surfaces as |
//! |---|---|
//! | HTTP 401 / `unauthorized` / `invalid_token` | [`Error::Retryable`] |
//! | unsupported protocol version | [`Error::VersionMismatch`] |
//! | any other error object | [`Error::NonRetryable`] |
//! | no response in time | [`Error::Timeout`] |

use std::time::Duration;

use serde_json::Value;

use crate::correlator::Correlator;
use crate::error::{Error, ErrorCode, JsonRpcError, Result};
use crate::protocol::{
    Implementation, InitializeParams, InitializeResult, SUPPORTED_PROTOCOL_VERSIONS, methods,
    notifications,
};

/// Default bound on the `initialize` round trip.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handshake progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializeState {
    Idle,
    AwaitingInit,
    Negotiated(String),
    Failed(String),
}

/// Drives the `initialize` exchange over a [`Correlator`].
#[derive(Debug, Clone)]
pub struct Initializer {
    versions: Vec<String>,
    client_info: Implementation,
    capabilities: Value,
    timeout: Duration,
    state: InitializeState,
}

impl Initializer {
    pub fn new(client_info: Implementation) -> Self {
        Self {
            versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            client_info,
            capabilities: Value::Object(Default::default()),
            timeout: DEFAULT_INIT_TIMEOUT,
            state: InitializeState::Idle,
        }
    }

    /// Acceptable versions, most preferred first. An empty list keeps the default.
    pub fn versions<I, V>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let versions: Vec<String> = versions.into_iter().map(Into::into).collect();
        if !versions.is_empty() {
            self.versions = versions;
        }
        self
    }

    pub fn capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> &InitializeState {
        &self.state
    }

    pub fn proposed_versions(&self) -> &[String] {
        &self.versions
    }

    /// The version sent in the `initialize` request.
    pub fn preferred_version(&self) -> &str {
        self.versions
            .first()
            .map(String::as_str)
            .unwrap_or(crate::protocol::LATEST_PROTOCOL_VERSION)
    }

    /// Send `initialize` and wait for the server's answer.
    ///
    /// Does not send `notifications/initialized`; see [`run`](Self::run) and
    /// [`confirm`](Self::confirm).
    pub async fn request(&mut self, correlator: &Correlator) -> Result<InitializeResult> {
        let requested = self.preferred_version().to_string();
        let params = InitializeParams {
            protocol_version: requested.clone(),
            capabilities: self.capabilities.clone(),
            client_info: self.client_info.clone(),
        };

        self.state = InitializeState::AwaitingInit;
        tracing::info!(version = %requested, client = %self.client_info.name, "Initializing session");

        let outcome = correlator
            .send_request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                self.timeout,
            )
            .await
            .map_err(|e| classify_error(e, &requested))
            .and_then(|value| {
                serde_json::from_value::<InitializeResult>(value).map_err(|e| {
                    Error::InvalidMessage(format!("Malformed initialize result: {}", e))
                })
            });

        match outcome {
            Ok(result) => {
                if result.protocol_version != requested {
                    tracing::info!(
                        requested = %requested,
                        negotiated = %result.protocol_version,
                        "Server chose a different protocol version"
                    );
                }
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Initialization failed");
                self.state = InitializeState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Emit `notifications/initialized` and record the negotiated version.
    pub async fn confirm(&mut self, correlator: &Correlator, result: &InitializeResult) -> Result<()> {
        if let Err(e) = correlator
            .send_notification(notifications::INITIALIZED, None)
            .await
        {
            self.state = InitializeState::Failed(e.to_string());
            return Err(e);
        }
        self.state = InitializeState::Negotiated(result.protocol_version.clone());
        tracing::info!(
            version = %result.protocol_version,
            server = %result.server_info.name,
            "Session initialized"
        );
        Ok(())
    }

    /// Mark the handshake failed without confirming it.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = InitializeState::Failed(reason.into());
    }

    /// Full handshake: [`request`](Self::request) then [`confirm`](Self::confirm).
    pub async fn run(&mut self, correlator: &Correlator) -> Result<InitializeResult> {
        let result = self.request(correlator).await?;
        self.confirm(correlator, &result).await?;
        Ok(result)
    }
}

/// Map a failed `initialize` round trip onto the caller-facing taxonomy.
pub fn classify_error(error: Error, requested: &str) -> Error {
    let rpc = match error {
        Error::JsonRpc(e) => e,
        other => return other,
    };

    if looks_like_auth_failure(&rpc) || is_transient_http_status(&rpc) {
        return Error::Retryable(rpc);
    }
    if looks_like_version_mismatch(&rpc) {
        return Error::VersionMismatch {
            requested: requested.to_string(),
            supported: advertised_versions(rpc.data.as_ref()),
        };
    }
    Error::NonRetryable(rpc)
}

fn looks_like_auth_failure(error: &JsonRpcError) -> bool {
    const MARKERS: &[&str] = &["401", "unauthorized", "invalid_token"];

    let message = error.message.to_ascii_lowercase();
    let data = error
        .data
        .as_ref()
        .map(|d| d.to_string().to_ascii_lowercase())
        .unwrap_or_default();
    MARKERS
        .iter()
        .any(|m| message.contains(m) || data.contains(m))
}

/// Statuses recorded by the HTTP transports that are worth retrying after a
/// credential refresh or a pause.
fn is_transient_http_status(error: &JsonRpcError) -> bool {
    let Some(status) = error
        .data
        .as_ref()
        .and_then(|d| d.get("httpStatus"))
        .and_then(|s| s.as_u64())
    else {
        return false;
    };
    matches!(status, 401 | 403 | 408 | 429) || (500..600).contains(&status)
}

fn looks_like_version_mismatch(error: &JsonRpcError) -> bool {
    let message = error.message.to_ascii_lowercase();
    let mentions_version = message.contains("protocol version")
        && (message.contains("unsupported") || message.contains("not supported"));
    let advertises = error
        .data
        .as_ref()
        .is_some_and(|d| d.get("supported").is_some() || d.get("supportedVersions").is_some());
    mentions_version || (error.code == ErrorCode::InvalidParams.code() && advertises)
}

fn advertised_versions(data: Option<&Value>) -> Vec<String> {
    data.and_then(|d| d.get("supported").or_else(|| d.get("supportedVersions")))
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcMessage;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<Correlator>, mpsc::Receiver<JsonRpcMessage>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (correlator, _notif) = Correlator::new(out_tx, 8);
        (Arc::new(correlator), out_rx)
    }

    async fn initialize_against(
        reply: impl FnOnce(JsonRpcMessage) -> Option<JsonRpcMessage> + Send + 'static,
        timeout: Duration,
    ) -> (Result<InitializeResult>, Vec<JsonRpcMessage>, InitializeState) {
        let (correlator, mut out_rx) = setup();
        let server_side = correlator.clone();
        let server = tokio::spawn(async move {
            let mut seen = Vec::new();
            let request = out_rx.recv().await.unwrap();
            seen.push(request.clone());
            if let Some(response) = reply(request) {
                server_side.route(response);
            }
            // Collect anything the client sends after the response.
            while let Ok(Some(msg)) =
                tokio::time::timeout(Duration::from_millis(50), out_rx.recv()).await
            {
                seen.push(msg);
            }
            seen
        });

        let mut init = Initializer::new(Implementation::new("test-client", "0.1.0"))
            .timeout(timeout);
        let result = init.run(&correlator).await;
        let seen = server.await.unwrap();
        (result, seen, init.state().clone())
    }

    #[tokio::test]
    async fn test_success_sends_initialized_notification() {
        let (result, seen, state) = initialize_against(
            |req| {
                assert_eq!(req.params.as_ref().unwrap()["protocolVersion"], "2025-06-18");
                Some(JsonRpcMessage::response(
                    req.id.unwrap(),
                    json!({
                        "protocolVersion": "2025-03-26",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "srv", "version": "1"}
                    }),
                ))
            },
            Duration::from_secs(5),
        )
        .await;

        // A different version from the server is accepted.
        assert_eq!(result.unwrap().protocol_version, "2025-03-26");
        assert_eq!(state, InitializeState::Negotiated("2025-03-26".to_string()));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].method.as_deref(), Some(notifications::INITIALIZED));
        assert!(seen[1].id.is_none());
    }

    #[tokio::test]
    async fn test_auth_failure_is_retryable() {
        let (result, seen, state) = initialize_against(
            |req| {
                Some(JsonRpcMessage::error_response(
                    req.id.unwrap(),
                    JsonRpcError::internal_error("HTTP 401: Unauthorized"),
                ))
            },
            Duration::from_secs(5),
        )
        .await;

        assert!(result.unwrap_err().is_retryable());
        assert!(matches!(state, InitializeState::Failed(_)));
        assert_eq!(seen.len(), 1, "no initialized notification on failure");
    }

    #[tokio::test]
    async fn test_version_mismatch_carries_supported_list() {
        let (result, _, _) = initialize_against(
            |req| {
                Some(JsonRpcMessage::error_response(
                    req.id.unwrap(),
                    JsonRpcError::invalid_params("Unsupported protocol version")
                        .with_data(json!({"supported": ["2024-11-05"], "requested": "2025-06-18"})),
                ))
            },
            Duration::from_secs(5),
        )
        .await;

        match result.unwrap_err() {
            Error::VersionMismatch {
                requested,
                supported,
            } => {
                assert_eq!(requested, "2025-06-18");
                assert_eq!(supported, vec!["2024-11-05".to_string()]);
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generic_error_is_non_retryable() {
        let (result, _, _) = initialize_against(
            |req| {
                Some(JsonRpcMessage::error_response(
                    req.id.unwrap(),
                    JsonRpcError::internal_error("database on fire"),
                ))
            },
            Duration::from_secs(5),
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::NonRetryable(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let (result, _, state) =
            initialize_against(|_| None, Duration::from_millis(30)).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout(_)));
        assert!(matches!(state, InitializeState::Failed(_)));
    }

    #[tokio::test]
    async fn test_malformed_result_is_invalid_message() {
        let (result, _, _) = initialize_against(
            |req| Some(JsonRpcMessage::response(req.id.unwrap(), json!({"nope": 1}))),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result.unwrap_err(), Error::InvalidMessage(_)));
    }

    #[test]
    fn test_classify_passes_through_connection_errors() {
        let err = classify_error(Error::Connection("gone".into()), "2025-06-18");
        assert!(err.is_connection());

        let err = classify_error(
            Error::JsonRpc(
                JsonRpcError::internal_error("boom").with_data(json!({"error": "invalid_token"})),
            ),
            "2025-06-18",
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_http_status_classification() {
        let status_error = |status: u16| {
            Error::JsonRpc(
                JsonRpcError::internal_error(format!("HTTP {}: nope", status))
                    .with_data(json!({ "httpStatus": status })),
            )
        };

        for status in [401, 403, 429, 500, 503] {
            assert!(
                classify_error(status_error(status), "2025-06-18").is_retryable(),
                "status {status}"
            );
        }
        for status in [400, 404, 422] {
            assert!(matches!(
                classify_error(status_error(status), "2025-06-18"),
                Error::NonRetryable(_)
            ));
        }
    }

    #[test]
    fn test_custom_versions_and_preference() {
        let init = Initializer::new(Implementation::new("c", "1"))
            .versions(["2024-11-05", "2025-03-26"]);
        assert_eq!(init.preferred_version(), "2024-11-05");
        assert_eq!(init.state(), &InitializeState::Idle);

        let init = Initializer::new(Implementation::new("c", "1")).versions(Vec::<String>::new());
        assert_eq!(init.preferred_version(), "2025-06-18");
    }
}
