//! Session establishment and resumption handshakes.
//!
//! The first handshake of a client instance is `start-session` with the full
//! descriptor. Every later one is `restart-session` carrying only the
//! identity, so the server resumes the same logical session.

use crate::error::SessionError;
use crate::model::{RestartReply, SessionState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use slick_wire::{msg_type, Envelope};

/// Fields identifying one logical session. Fixed for the client's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    /// Site identifier
    pub site: String,
    /// Persistent reader identifier
    pub reader: String,
    /// Session start, epoch milliseconds
    pub start: i64,
    /// Client version string
    pub client_version: String,
}

/// Everything sent with `start-session`
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescriptor {
    /// Identity fields
    pub identity: SessionIdentity,
    /// Page and environment details (URL, referrer, display size, timing
    /// marks, auth flags, ...)
    pub details: Map<String, Value>,
}

impl SessionDescriptor {
    /// Descriptor with no extra details
    pub fn new(identity: SessionIdentity) -> Self {
        Self {
            identity,
            details: Map::new(),
        }
    }

    /// Add one detail field
    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    /// Payload of `start-session`: details with the identity fields on top
    pub fn start_payload(&self) -> Value {
        let mut payload = self.details.clone();
        if let Value::Object(identity) = self.restart_payload() {
            payload.extend(identity);
        }
        Value::Object(payload)
    }

    /// Payload of `restart-session`: identity only
    pub fn restart_payload(&self) -> Value {
        serde_json::to_value(&self.identity).unwrap_or(Value::Null)
    }
}

/// Build the `start-session` request
pub fn start_request(message_id: u64, descriptor: &SessionDescriptor) -> Envelope {
    Envelope::request(message_id, msg_type::START_SESSION, descriptor.start_payload())
}

/// Build the `restart-session` request
pub fn restart_request(message_id: u64, descriptor: &SessionDescriptor) -> Envelope {
    Envelope::request(message_id, msg_type::RESTART_SESSION, descriptor.restart_payload())
}

/// Interpret a `start-session` reply
pub fn parse_start_reply(payload: Value) -> Result<SessionState, SessionError> {
    if !payload.is_object() {
        return Err(SessionError::InvalidReply(format!(
            "start-session reply is not an object: {}",
            payload
        )));
    }
    serde_json::from_value(payload).map_err(|e| SessionError::InvalidReply(e.to_string()))
}

/// Interpret a `restart-session` reply. A missing payload means nothing changed.
pub fn parse_restart_reply(payload: Value) -> Result<RestartReply, SessionError> {
    if payload.is_null() {
        return Ok(RestartReply::default());
    }
    serde_json::from_value(payload).map_err(|e| SessionError::InvalidReply(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor::new(SessionIdentity {
            site: "site-1".into(),
            reader: "1718000000000.abc".into(),
            start: 1718000000123,
            client_version: "0.1.0".into(),
        })
        .with_detail("url", json!("https://example.org/a"))
        .with_detail("referrer", json!("https://search.example/"))
        .with_detail("site", json!("spoofed"))
    }

    #[test]
    fn test_start_payload_carries_details_and_identity() {
        let env = start_request(1, &descriptor());
        assert_eq!(env.msg_type.as_deref(), Some("start-session"));
        assert_eq!(env.payload["url"], "https://example.org/a");
        assert_eq!(env.payload["referrer"], "https://search.example/");
        assert_eq!(env.payload["reader"], "1718000000000.abc");
        assert_eq!(env.payload["clientVersion"], "0.1.0");
        // Identity wins over a detail with the same name
        assert_eq!(env.payload["site"], "site-1");
    }

    #[test]
    fn test_restart_payload_is_identity_only() {
        let env = restart_request(2, &descriptor());
        assert_eq!(env.msg_type.as_deref(), Some("restart-session"));
        let fields = env.payload.as_object().unwrap();
        let mut keys: Vec<_> = fields.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["clientVersion", "reader", "site", "start"]);
        assert_eq!(env.payload["start"], 1718000000123i64);
    }

    #[test]
    fn test_parse_replies() {
        assert!(parse_start_reply(json!("nope")).is_err());
        let state = parse_start_reply(json!({ "activeVisitors": 2 })).unwrap();
        assert_eq!(state.active_visitors, 2);

        assert_eq!(parse_restart_reply(Value::Null).unwrap(), RestartReply::default());
        assert!(parse_restart_reply(json!({ "activeVisitors": "many" })).is_err());
    }
}
