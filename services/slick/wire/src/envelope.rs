//! The message envelope exchanged over the connection.
//!
//! An envelope carries a direction, an optional message type, the id used to
//! correlate responses with requests, and an arbitrary JSON payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Envelope directions as defined in the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Request awaiting a correlated response or error
    Request,
    /// Successful reply to a request
    Response,
    /// Fire-and-forget notification (either side)
    Notify,
    /// Failed reply to a request
    Error,
    /// Liveness ping
    Ping,
    /// Reply to a liveness ping
    Pong,
}

impl Direction {
    /// Protocol string for this direction
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
            Direction::Notify => "notify",
            Direction::Error => "error",
            Direction::Ping => "ping",
            Direction::Pong => "pong",
        }
    }

    /// Whether this direction terminates a pending request
    pub fn is_reply(&self) -> bool {
        matches!(self, Direction::Response | Direction::Error)
    }
}

impl TryFrom<&str> for Direction {
    type Error = crate::WireError;

    fn try_from(value: &str) -> Result<Self, crate::WireError> {
        match value {
            "request" => Ok(Direction::Request),
            "response" => Ok(Direction::Response),
            "notify" => Ok(Direction::Notify),
            "error" => Ok(Direction::Error),
            "ping" => Ok(Direction::Ping),
            "pong" => Ok(Direction::Pong),
            other => Err(crate::WireError::Direction(other.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One serialized message unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Send time in epoch milliseconds
    pub at: i64,
    /// Correlation id, unique per client instance
    pub message_id: u64,
    /// Envelope direction
    pub direction: Direction,
    /// Optional message type (`start-session`, `heart`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    /// Message payload
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Create an envelope stamped with the current time
    pub fn new(
        direction: Direction,
        message_id: u64,
        msg_type: Option<&str>,
        payload: Value,
    ) -> Self {
        Self {
            at: now_ms(),
            message_id,
            direction,
            msg_type: msg_type.map(str::to_string),
            payload,
        }
    }

    /// Build a request envelope
    pub fn request(message_id: u64, msg_type: &str, payload: Value) -> Self {
        Self::new(Direction::Request, message_id, Some(msg_type), payload)
    }

    /// Build a notify envelope
    pub fn notify(message_id: u64, msg_type: &str, payload: Value) -> Self {
        Self::new(Direction::Notify, message_id, Some(msg_type), payload)
    }

    /// Build a PING envelope
    pub fn ping(message_id: u64) -> Self {
        Self::new(Direction::Ping, message_id, None, Value::Object(Default::default()))
    }

    /// Build a PONG envelope answering the given PING id
    pub fn pong(message_id: u64) -> Self {
        Self::new(Direction::Pong, message_id, None, Value::Object(Default::default()))
    }

    /// Message type or the empty string
    pub fn msg_type_or_empty(&self) -> &str {
        self.msg_type.as_deref().unwrap_or("")
    }

    /// Server-provided description carried by an `error` envelope
    pub fn error_description(&self) -> String {
        ["description", "message", "error"]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .or_else(|| self.payload.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown server error".to_string())
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direction_strings() {
        for direction in [
            Direction::Request,
            Direction::Response,
            Direction::Notify,
            Direction::Error,
            Direction::Ping,
            Direction::Pong,
        ] {
            assert_eq!(Direction::try_from(direction.as_str()).unwrap(), direction);
        }
        assert!(matches!(
            Direction::try_from("broadcast"),
            Err(crate::WireError::Direction(ref d)) if d == "broadcast"
        ));
        assert!(Direction::Error.is_reply());
        assert!(!Direction::Notify.is_reply());
    }

    #[test]
    fn test_error_description() {
        let env = Envelope::new(
            Direction::Error,
            7,
            Some("heart"),
            json!({ "description": "not allowed" }),
        );
        assert_eq!(env.error_description(), "not allowed");

        let env = Envelope::new(Direction::Error, 8, None, json!("rate limited"));
        assert_eq!(env.error_description(), "rate limited");

        let env = Envelope::new(Direction::Error, 9, None, json!({}));
        assert_eq!(env.error_description(), "unknown server error");
    }

    #[test]
    fn test_ping_pong_carry_id() {
        let ping = Envelope::ping(11);
        assert_eq!(ping.direction, Direction::Ping);
        assert_eq!(ping.message_id, 11);
        assert!(ping.msg_type.is_none());

        let pong = Envelope::pong(ping.message_id);
        assert_eq!(pong.direction, Direction::Pong);
        assert_eq!(pong.message_id, 11);
    }
}
