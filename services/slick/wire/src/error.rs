//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame is not valid JSON or does not match the envelope shape
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame parsed but is structurally unusable
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// Direction string not part of the protocol
    #[error("unknown direction {0}")]
    Direction(String),
}
