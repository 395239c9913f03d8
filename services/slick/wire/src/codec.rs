//! Encoding and decoding for the wire protocol.

use crate::envelope::Envelope;
use crate::error::WireError;
use serde_json::Value;
use tracing::trace;

/// Serialize an envelope into one text frame
pub fn encode(envelope: &Envelope) -> Result<String, WireError> {
    let text = serde_json::to_string(envelope)?;
    trace!(
        "Encoded {} envelope {} ({} bytes)",
        envelope.direction,
        envelope.message_id,
        text.len()
    );
    Ok(text)
}

/// Parse one text frame into an envelope
pub fn decode(text: &str) -> Result<Envelope, WireError> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(WireError::Malformed("envelope is not an object".to_string()));
    }
    if let Some(direction) = value.get("direction").and_then(Value::as_str) {
        // Surface unknown directions as their own error rather than a serde message
        crate::envelope::Direction::try_from(direction)?;
    }
    Ok(serde_json::from_value(value)?)
}
