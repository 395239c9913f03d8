//! Wire envelope, message types and JSON codec for the slick session protocol.
//!
//! Every unit exchanged over the persistent connection is one JSON-serialized
//! [`Envelope`]. The connection negotiates the [`SUBPROTOCOL`] token and all
//! correlation between requests and their responses happens through the
//! envelope's `messageId`.
//!
//! ## Wire Format
//!
//! ```text
//! {
//!   "at":        1718000000000,        // epoch milliseconds
//!   "messageId": 42,                   // monotonic per client instance
//!   "direction": "request",            // request|response|notify|error|ping|pong
//!   "msgType":   "heart",              // optional
//!   "payload":   { "hearts": 1 }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod envelope;
pub mod error;
pub mod msg_type;

// Re-export main types
pub use codec::{decode, encode};
pub use envelope::{now_ms, Direction, Envelope};
pub use error::WireError;

/// Subprotocol token negotiated when the connection is opened
pub const SUBPROTOCOL: &str = "SLICK_CLIENT_1";
