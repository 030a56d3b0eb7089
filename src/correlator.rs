//! Request/response correlation
//!
//! The [`Correlator`] owns the map of outstanding requests. Each request
//! registers a one-shot waiter keyed by its id; inbound messages are routed
//! by [`Correlator::route`] to the matching waiter, or to the notification
//! channel when they carry no id.
//!
//! Every waiter is resolved exactly once: by its response, by its caller's
//! timeout (which removes the entry), or by [`Correlator::fail_all`] when the
//! transport goes away. Late or duplicate responses find no entry and are
//! dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::protocol::{JsonRpcMessage, MessageKind, RequestId};

/// Default capacity of the notification channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

type Waiter = oneshot::Sender<Result<Value>>;

/// A registered waiter, tagged so a caller only ever removes its own entry.
struct Pending {
    registration: u64,
    tx: Waiter,
}

/// Matches responses to outstanding requests by id.
pub struct Correlator {
    pending: Mutex<HashMap<RequestId, Pending>>,
    next_id: AtomicI64,
    registrations: AtomicU64,
    closed: AtomicBool,
    outbound: mpsc::Sender<JsonRpcMessage>,
    notifications: mpsc::Sender<JsonRpcMessage>,
}

impl Correlator {
    /// Create a correlator writing to `outbound`.
    ///
    /// Returns the receiving side of the notification channel. Server
    /// notifications and server-initiated requests are delivered there; when
    /// it is full or nobody is listening they are dropped.
    pub fn new(
        outbound: mpsc::Sender<JsonRpcMessage>,
        notification_capacity: usize,
    ) -> (Self, mpsc::Receiver<JsonRpcMessage>) {
        let (notifications, notifications_rx) = mpsc::channel(notification_capacity.max(1));
        let correlator = Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            registrations: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            outbound,
            notifications,
        };
        (correlator, notifications_rx)
    }

    /// Allocate a fresh request id.
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Whether [`fail_all`](Self::fail_all) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a request with a freshly allocated id and wait for its outcome.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id();
        self.send_request_with_id(id, method, params, timeout).await
    }

    /// Send a request with a caller-supplied id and wait for its outcome.
    ///
    /// `timeout` bounds the whole exchange, including the wait for room in
    /// the outbound queue.
    pub async fn send_request_with_id(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let mut request = JsonRpcMessage::request(id.clone(), method);
        request.params = params;

        let (registration, rx) = self.register(id.clone())?;
        // Removes the waiter if this future is dropped or times out.
        let _guard = PendingGuard {
            correlator: self,
            id: id.clone(),
            registration,
        };

        tracing::debug!(method = %method, id = %id, "Sending request");
        let exchange = async {
            self.outbound
                .send(request)
                .await
                .map_err(|_| Error::Connection("Outbound channel closed".to_string()))?;
            rx.await.unwrap_or_else(|_| {
                Err(Error::Connection(
                    "Transport closed before a response arrived".to_string(),
                ))
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(method = %method, id = %id, ?timeout, "Request timed out");
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Queue a notification. Returns once it is handed to the transport.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Connection("Connection closed".to_string()));
        }
        let mut notification = JsonRpcMessage::notification(method);
        notification.params = params;

        tracing::debug!(method = %method, "Sending notification");
        self.outbound
            .send(notification)
            .await
            .map_err(|_| Error::Connection("Outbound channel closed".to_string()))
    }

    /// Queue an already-built message (for example a response to a server request).
    pub async fn send_message(&self, message: JsonRpcMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::Connection("Outbound channel closed".to_string()))
    }

    /// Route one inbound message.
    pub fn route(&self, message: JsonRpcMessage) {
        let kind = match message.kind() {
            Ok(kind) => kind,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding invalid inbound message");
                return;
            }
        };

        match kind {
            MessageKind::Response | MessageKind::Error => {
                let Some(id) = message.id.clone() else {
                    return;
                };
                let waiter = self.lock_pending().remove(&id);
                match waiter {
                    Some(Pending { tx, .. }) => {
                        tracing::debug!(id = %id, "Resolving pending request");
                        // The caller may have given up already.
                        let _ = tx.send(message.into_outcome());
                    }
                    None => {
                        tracing::debug!(id = %id, "Dropping response with no pending request");
                    }
                }
            }
            MessageKind::Notification | MessageKind::Request => {
                let method = message.method.clone().unwrap_or_default();
                match self.notifications.try_send(message) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(method = %method, "Notification channel full, dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::trace!(method = %method, "No notification listener");
                    }
                }
            }
        }
    }

    /// Fail every pending request with a connection error and refuse new ones.
    pub fn fail_all(&self, reason: &str) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<Pending> = self.lock_pending().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), reason = %reason, "Failing pending requests");
        }
        for Pending { tx, .. } in drained {
            let _ = tx.send(Err(Error::Connection(reason.to_string())));
        }
    }

    fn register(&self, id: RequestId) -> Result<(u64, oneshot::Receiver<Result<Value>>)> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock_pending();
        // Checked under the lock so fail_all cannot miss this waiter.
        if self.is_closed() {
            return Err(Error::Connection("Connection closed".to_string()));
        }
        if pending.contains_key(&id) {
            return Err(Error::Internal(format!(
                "Request id {} is already in flight",
                id
            )));
        }
        let registration = self.registrations.fetch_add(1, Ordering::Relaxed);
        pending.insert(id, Pending { registration, tx });
        Ok((registration, rx))
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Pending>> {
        // A poisoned map is still structurally valid.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: RequestId,
    registration: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.correlator.lock_pending();
        // The id may already belong to a newer request.
        if pending
            .get(&self.id)
            .is_some_and(|p| p.registration == self.registration)
        {
            pending.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JsonRpcError;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (
        Arc<Correlator>,
        mpsc::Receiver<JsonRpcMessage>,
        mpsc::Receiver<JsonRpcMessage>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (correlator, notif_rx) = Correlator::new(out_tx, 4);
        (Arc::new(correlator), out_rx, notif_rx)
    }

    #[tokio::test]
    async fn test_responses_resolve_matching_waiters_in_any_order() {
        let (correlator, mut out_rx, _notif) = setup();

        let mut handles = Vec::new();
        for i in 0..5 {
            let c = correlator.clone();
            handles.push(tokio::spawn(async move {
                c.send_request("echo", Some(json!({ "n": i })), Duration::from_secs(5))
                    .await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..5 {
            requests.push(out_rx.recv().await.unwrap());
        }
        // Answer in reverse order, echoing each request's params.
        for req in requests.into_iter().rev() {
            let id = req.id.clone().unwrap();
            correlator.route(JsonRpcMessage::response(id, req.params.unwrap()));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result, json!({ "n": i }));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_is_ignored() {
        let (correlator, mut out_rx, _notif) = setup();

        let c = correlator.clone();
        let handle = tokio::spawn(async move {
            c.send_request("ping", None, Duration::from_secs(5)).await
        });

        let req = out_rx.recv().await.unwrap();
        let id = req.id.unwrap();
        correlator.route(JsonRpcMessage::response(id.clone(), json!({"first": true})));
        correlator.route(JsonRpcMessage::response(id, json!({"second": true})));

        assert_eq!(handle.await.unwrap().unwrap(), json!({"first": true}));
    }

    #[tokio::test]
    async fn test_error_response_surfaces_as_error() {
        let (correlator, mut out_rx, _notif) = setup();

        let c = correlator.clone();
        let handle = tokio::spawn(async move {
            c.send_request("missing", None, Duration::from_secs(5)).await
        });

        let req = out_rx.recv().await.unwrap();
        correlator.route(JsonRpcMessage::error_response(
            req.id.unwrap(),
            JsonRpcError::method_not_found("missing"),
        ));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::JsonRpc(e) if e.code == -32601));
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter() {
        let (correlator, mut out_rx, _notif) = setup();

        let err = correlator
            .send_request("slow", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(correlator.pending_count(), 0);

        // A late response is a no-op.
        let req = out_rx.recv().await.unwrap();
        correlator.route(JsonRpcMessage::response(req.id.unwrap(), json!({})));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_resolves_every_waiter() {
        let (correlator, _out_rx, _notif) = setup();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let c = correlator.clone();
            handles.push(tokio::spawn(async move {
                c.send_request("never", None, Duration::from_secs(60)).await
            }));
        }
        while correlator.pending_count() < 3 {
            tokio::task::yield_now().await;
        }

        correlator.fail_all("transport stopped");
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_connection());
        }

        let err = correlator
            .send_request("after", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_caller_supplied_id_collision() {
        let (correlator, _out_rx, _notif) = setup();

        let c = correlator.clone();
        let first = tokio::spawn(async move {
            c.send_request_with_id("fixed".into(), "a", None, Duration::from_secs(60))
                .await
        });
        while correlator.pending_count() < 1 {
            tokio::task::yield_now().await;
        }

        let err = correlator
            .send_request_with_id("fixed".into(), "b", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        // The rejected duplicate must not disturb the original waiter.
        assert_eq!(correlator.pending_count(), 1);

        correlator.route(JsonRpcMessage::response("fixed".into(), json!("ok")));
        assert_eq!(first.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_timeout_covers_full_outbound_queue() {
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (correlator, _notif) = Correlator::new(out_tx, 4);
        correlator
            .send_notification("notifications/progress", None)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            correlator.send_request("stuck", None, Duration::from_millis(50)),
        )
        .await
        .expect("request deadline applies while the queue is full")
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reused_id_keeps_newer_waiter() {
        let (correlator, mut out_rx, _notif) = setup();

        let mut first = Box::pin(correlator.send_request_with_id(
            "reused".into(),
            "a",
            None,
            Duration::from_secs(5),
        ));
        assert!(futures::poll!(&mut first).is_pending());
        out_rx.recv().await.unwrap();

        // Answer the first request but register the second before the first
        // caller observes its result.
        correlator.route(JsonRpcMessage::response("reused".into(), json!("first")));
        let mut second = Box::pin(correlator.send_request_with_id(
            "reused".into(),
            "b",
            None,
            Duration::from_secs(5),
        ));
        assert!(futures::poll!(&mut second).is_pending());

        assert_eq!(first.await.unwrap(), json!("first"));
        assert_eq!(correlator.pending_count(), 1);

        correlator.route(JsonRpcMessage::response("reused".into(), json!("second")));
        assert_eq!(second.await.unwrap(), json!("second"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_notifications_routed_and_dropped_when_full() {
        let (correlator, _out_rx, mut notif_rx) = setup();

        for i in 0..6 {
            correlator.route(
                JsonRpcMessage::notification("notifications/progress")
                    .with_params(json!({ "progress": i })),
            );
        }

        // Capacity is 4; the rest were dropped without blocking.
        let mut received = 0;
        while let Ok(msg) = notif_rx.try_recv() {
            assert_eq!(msg.params.unwrap()["progress"], received);
            received += 1;
        }
        assert_eq!(received, 4);
    }
}
