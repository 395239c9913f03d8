//! In-process connector for exercising the session client without a network.
//!
//! Only built for tests and under the `test-util` feature.

use crate::error::TransportError;
use crate::transport::{Connector, Link, LinkFrame};
use async_trait::async_trait;
use parking_lot::Mutex;
use slick_wire::Envelope;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

struct LoopbackShared {
    attempts: AtomicUsize,
    refuse: AtomicBool,
    urls: Mutex<Vec<String>>,
    peers_tx: mpsc::UnboundedSender<LoopbackPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LoopbackPeer>>,
}

/// In-process connector whose server side is driven by the embedding code
#[derive(Clone)]
pub struct LoopbackConnector {
    shared: Arc<LoopbackShared>,
}

impl LoopbackConnector {
    /// Create a connector accepting connections
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(LoopbackShared {
                attempts: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
                urls: Mutex::new(Vec::new()),
                peers_tx,
                peers_rx: tokio::sync::Mutex::new(peers_rx),
            }),
        }
    }

    /// Number of connection attempts made so far, refused ones included
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// URLs of every attempt, in order
    pub fn urls(&self) -> Vec<String> {
        self.shared.urls.lock().clone()
    }

    /// Make subsequent attempts fail (or succeed again)
    pub fn set_refuse(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Wait for the next accepted connection
    pub async fn accept(&self) -> Option<LoopbackPeer> {
        self.shared.peers_rx.lock().await.recv().await
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        self.shared.urls.lock().push(url.to_string());

        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Refused(url.to_string()));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let peer = LoopbackPeer {
            url: url.to_string(),
            to_client,
            from_client,
        };
        self.shared
            .peers_tx
            .send(peer)
            .map_err(|_| TransportError::Refused(url.to_string()))?;

        Ok(Link {
            outbound: to_server,
            inbound: from_server,
        })
    }
}

/// Server side of a loopback link. Dropping it closes the connection.
pub struct LoopbackPeer {
    /// URL the client connected to
    pub url: String,
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<LinkFrame>,
}

impl LoopbackPeer {
    /// Send a raw text frame to the client
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    /// Send an envelope to the client
    pub fn send(&self, envelope: &Envelope) -> bool {
        match slick_wire::encode(envelope) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Next raw frame from the client; `None` once the client side is gone
    pub async fn recv_frame(&mut self) -> Option<LinkFrame> {
        self.from_client.recv().await
    }

    /// Next decodable envelope; `None` on close
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.from_client.recv().await? {
                LinkFrame::Text(text) => match slick_wire::decode(&text) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => warn!("Loopback peer dropping undecodable frame: {}", e),
                },
                LinkFrame::Close => return None,
            }
        }
    }

    /// Read the next envelope, which must be a handshake request, and answer it
    pub async fn answer_handshake(&mut self, session: serde_json::Value) -> Option<Envelope> {
        let request = self.recv().await?;
        let reply = Envelope::new(
            slick_wire::Direction::Response,
            request.message_id,
            request.msg_type.as_deref(),
            session,
        );
        self.send(&reply);
        Some(request)
    }

    /// Drain frames already written by the client without waiting
    pub fn try_recv_all(&mut self) -> Vec<LinkFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use slick_wire::Direction;

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        let connector = LoopbackConnector::new();
        let mut link = connector.connect("ws://loop/?site=s").await.unwrap();
        let mut peer = connector.accept().await.unwrap();
        assert_eq!(peer.url, "ws://loop/?site=s");

        let env = Envelope::notify(1, "activity", json!({ "engagedMs": 10 }));
        link.outbound
            .send(LinkFrame::Text(slick_wire::encode(&env).unwrap()))
            .unwrap();
        let got = peer.recv().await.unwrap();
        assert_eq!(got.msg_type.as_deref(), Some("activity"));

        assert!(peer.send(&Envelope::pong(5)));
        let text = link.inbound.recv().await.unwrap();
        assert_eq!(slick_wire::decode(&text).unwrap().direction, Direction::Pong);

        drop(peer);
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_loopback_refuse_counts_attempts() {
        let connector = LoopbackConnector::new();
        connector.set_refuse(true);
        assert!(matches!(
            connector.connect("ws://loop/").await,
            Err(TransportError::Refused(_))
        ));
        connector.set_refuse(false);
        assert!(connector.connect("ws://loop/").await.is_ok());
        assert_eq!(connector.attempts(), 2);
        assert_eq!(connector.urls().len(), 2);
    }

    #[tokio::test]
    async fn test_closed_client_reaches_peer() {
        let connector = LoopbackConnector::new();
        let link = connector.connect("ws://loop/").await.unwrap();
        let mut peer = connector.accept().await.unwrap();

        link.outbound.send(LinkFrame::Close).unwrap();
        assert_eq!(peer.recv_frame().await, Some(LinkFrame::Close));
        drop(link);
        assert!(peer.recv().await.is_none());
        assert!(!peer.send_text("late"));
    }
}
