//! In-memory transport
//!
//! [`ChannelTransport::pair`] returns a client-side [`Transport`] and the
//! [`ChannelPeer`] holding the other ends of its queues. The peer can be
//! driven by hand in tests or handed to [`ChannelPeer::serve`] to put an
//! [`McpServer`] behind it in the same process.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{DEFAULT_CHANNEL_CAPACITY, Transport, TransportState, TransportStreams, begin_start};
use crate::error::Result;
use crate::jsonrpc::JsonRpcService;
use crate::protocol::JsonRpcMessage;
use crate::server::McpServer;

/// Client transport backed by in-process channels.
pub struct ChannelTransport {
    from_peer: Option<mpsc::Receiver<JsonRpcMessage>>,
    to_peer: Option<mpsc::Sender<JsonRpcMessage>>,
    pump: Option<JoinHandle<()>>,
    state: TransportState,
}

/// The far side of a [`ChannelTransport`].
pub struct ChannelPeer {
    /// Messages the client sent
    pub incoming: mpsc::Receiver<JsonRpcMessage>,
    /// Messages to deliver to the client
    pub outgoing: mpsc::Sender<JsonRpcMessage>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelPeer) {
        let (client_tx, peer_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (peer_tx, client_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let transport = ChannelTransport {
            from_peer: Some(client_rx),
            to_peer: Some(client_tx),
            pump: None,
            state: TransportState::NotStarted,
        };
        let peer = ChannelPeer {
            incoming: peer_rx,
            outgoing: peer_tx,
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn start(&mut self) -> Result<TransportStreams> {
        begin_start(&mut self.state)?;
        let (Some(mut from_peer), Some(to_peer)) = (self.from_peer.take(), self.to_peer.take())
        else {
            self.state = TransportState::Stopped;
            return Err(crate::Error::Connection("Channel already consumed".to_string()));
        };

        // Forward through a task we own so `stop` can cut the inbound side.
        let (in_tx, in_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        self.pump = Some(tokio::spawn(async move {
            while let Some(message) = from_peer.recv().await {
                if in_tx.send(message).await.is_err() {
                    break;
                }
            }
        }));

        self.state = TransportState::Running;
        Ok(TransportStreams {
            inbound: in_rx,
            outbound: to_peer,
        })
    }

    async fn stop(&mut self) {
        self.state = TransportState::Stopping;
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        self.state = TransportState::Stopped;
    }

    fn state(&self) -> TransportState {
        self.state
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl ChannelPeer {
    /// Answer the client with `server` until either side goes away.
    pub fn serve(self, server: McpServer) -> JoinHandle<()> {
        let ChannelPeer {
            mut incoming,
            outgoing,
        } = self;
        let service = JsonRpcService::new(server);

        tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                let service = service.clone();
                let outgoing = outgoing.clone();
                tokio::spawn(async move {
                    let payload = match message.to_value() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to encode inbound message");
                            return;
                        }
                    };
                    let Some(reply) = service.call_payload(payload).await else {
                        return;
                    };
                    match crate::codec::decode_value(reply) {
                        Ok(frame) => {
                            for response in frame.into_messages() {
                                if outgoing.send(response).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Dropping undeliverable reply"),
                    }
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (mut transport, mut peer) = ChannelTransport::pair();
        let mut streams = transport.start().await.unwrap();

        streams
            .outbound
            .send(JsonRpcMessage::notification("notifications/initialized"))
            .await
            .unwrap();
        let seen = peer.incoming.recv().await.unwrap();
        assert_eq!(seen.method.as_deref(), Some("notifications/initialized"));

        peer.outgoing
            .send(JsonRpcMessage::notification("notifications/progress"))
            .await
            .unwrap();
        let got = streams.inbound.recv().await.unwrap();
        assert_eq!(got.method.as_deref(), Some("notifications/progress"));
    }

    #[tokio::test]
    async fn test_stop_closes_inbound() {
        let (mut transport, _peer) = ChannelTransport::pair();
        let mut streams = transport.start().await.unwrap();
        transport.stop().await;
        assert!(streams.inbound.recv().await.is_none());
        assert_eq!(transport.state(), TransportState::Stopped);
        assert!(transport.start().await.is_err());
    }
}
