//! Physical links: the websocket client and the [`Connector`] seam.
//!
//! A [`Link`] is a pair of channels. Frames pushed into `outbound` are
//! written in order; text frames from the peer arrive on `inbound`, and the
//! inbound channel ending means the connection is gone.

use crate::error::TransportError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use slick_wire::SUBPROTOCOL;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

/// Frame written to a link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkFrame {
    /// One text message
    Text(String),
    /// Close the connection after everything queued before it
    Close,
}

/// An open bidirectional connection
#[derive(Debug)]
pub struct Link {
    /// Frames to the peer
    pub outbound: mpsc::UnboundedSender<LinkFrame>,
    /// Text frames from the peer
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens links to the backend
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to `url`
    async fn connect(&self, url: &str) -> Result<Link, TransportError>;
}

/// Websocket connector negotiating the slick subprotocol
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector that gives up opening after `connect_timeout`
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            url: url.to_string(),
            reason,
        };

        let mut request = url
            .into_client_request()
            .map_err(|e| connect_error(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let (ws, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| TransportError::Timeout {
                    url: url.to_string(),
                    timeout: self.connect_timeout,
                })?
                .map_err(|e| connect_error(e.to_string()))?;

        debug!("Websocket connection established to {}", url);

        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<LinkFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        // Writer: drains frames in order, closes when told to or when the
        // sending side goes away
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    LinkFrame::Text(text) => {
                        trace!("Writing {} byte frame", text.len());
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            warn!("Websocket write failed: {}", e);
                            return;
                        }
                    }
                    LinkFrame::Close => break,
                }
            }
            if let Err(e) = sink.close().await {
                debug!("Websocket close failed: {}", e);
            }
        });

        // Reader: forwards text frames until the peer closes
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("Websocket closed by peer: {:?}", frame);
                        break;
                    }
                    Ok(Message::Binary(data)) => {
                        debug!("Ignoring {} byte binary frame", data.len());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Websocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
