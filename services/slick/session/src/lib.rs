//! Persistent websocket session client for slick.
//!
//! This crate keeps one logical session with the backend alive across
//! physical reconnects. It owns the connection state machine, correlates
//! requests with replies by message id, detects dead links with PING/PONG
//! and supervises reconnects with throttling.
//!
//! ## Features
//!
//! - **Shared establishment**: concurrent [`TransportClient::ensure_session`]
//!   calls share one connection attempt and one handshake
//! - **Resumption**: the first handshake is `start-session`, every later one
//!   is `restart-session` with the same identity
//! - **Ordered queue**: messages sent while disconnected are flushed in order
//!   once the session is back
//! - **Liveness**: a link silent for longer than the pong timeout is replaced
//! - **Throttled retries**: after repeated failures only every n-th supervisor
//!   tick makes an attempt
//!
//! ## Example
//!
//! ```rust,no_run
//! use slick_bus::MessageBus;
//! use slick_session::{
//!     ClientConfig, SessionDescriptor, SessionIdentity, TransportClient, WebSocketConnector,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let identity = SessionIdentity {
//!     site: "site-1".into(),
//!     reader: "1718000000000.k3j9".into(),
//!     start: 1718000000000,
//!     client_version: "0.1.0".into(),
//! };
//! let client = TransportClient::new(
//!     ClientConfig::default(),
//!     SessionDescriptor::new(identity),
//!     Arc::new(WebSocketConnector::default()),
//!     MessageBus::new(),
//! );
//!
//! let session = client.ensure_session().await?;
//! println!("{} visitors online", session.active_visitors);
//!
//! let reply = client
//!     .request("search", serde_json::json!({ "query": "rust" }), None)
//!     .await?;
//! println!("{}", reply);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod handshake;
pub mod keepalive;
#[cfg(any(test, feature = "test-util"))]
pub mod loopback;
pub mod model;
pub mod pending;
pub mod state;
pub mod supervisor;
pub mod transport;

// Re-export main types
pub use client::{ActivitySource, ClientConfig, TransportClient, Visibility, DEFAULT_ENDPOINT};
pub use error::{RequestError, SessionError, TransportError};
pub use handshake::{SessionDescriptor, SessionIdentity};
pub use keepalive::Liveness;
pub use model::{PageState, PageSummary, RestartReply, SessionState};
pub use pending::PendingRequests;
pub use state::ConnectionState;
pub use supervisor::{RetryThrottle, TickDecision};
pub use transport::{Connector, Link, LinkFrame, WebSocketConnector};

#[cfg(any(test, feature = "test-util"))]
pub use loopback::{LoopbackConnector, LoopbackPeer};
