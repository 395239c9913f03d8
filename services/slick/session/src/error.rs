//! Session client error types.

use std::time::Duration;
use thiserror::Error;

/// Failures opening or using a physical link
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The connection could not be opened
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// Target URL
        url: String,
        /// Underlying cause
        reason: String,
    },
    /// Opening the connection took too long
    #[error("connecting to {url} timed out after {timeout:?}")]
    Timeout {
        /// Target URL
        url: String,
        /// Configured connect timeout
        timeout: Duration,
    },
    /// The connector refused the attempt
    #[error("connection refused: {0}")]
    Refused(String),
}

/// Terminal failure of one request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    /// No reply arrived in time
    #[error("request {id} timed out after {timeout:?}")]
    Timeout {
        /// Message id of the request
        id: u64,
        /// Timeout that elapsed
        timeout: Duration,
    },
    /// The server answered with an `error` envelope
    #[error("server error: {description}")]
    Server {
        /// Server-provided description
        description: String,
    },
    /// The link carrying the request went away before a reply
    #[error("connection lost before a reply arrived")]
    NotConnected,
    /// The completion handle was dropped without an outcome
    #[error("request {0} was abandoned")]
    Dropped(u64),
    /// An entry for this id is already outstanding
    #[error("request id {0} is already pending")]
    DuplicateId(u64),
    /// The envelope could not be serialized
    #[error("failed to encode request: {0}")]
    Encode(String),
}

/// Failure to establish or resume a session
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The configured endpoint is not a usable websocket URL
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    /// The physical connection failed
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The handshake request failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] RequestError),
    /// The handshake reply could not be interpreted
    #[error("unexpected handshake reply: {0}")]
    InvalidReply(String),
    /// The attempt was superseded by a disconnect or a newer attempt
    #[error("connection attempt superseded")]
    Superseded,
    /// The client was shut down
    #[error("session client is shut down")]
    Closed,
}

impl SessionError {
    /// Whether retrying later may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SessionError::Closed | SessionError::InvalidEndpoint(_))
    }
}
