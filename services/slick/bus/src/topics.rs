//! Well-known bus topics.

/// Session state was established, merged or mutated
pub const SESSION_UPDATED: &str = "session-updated";
/// The physical connection closed (clean or not)
pub const SOCKET_CLOSED: &str = "socket-closed";
/// The locale derived from the session language changed
pub const LOCALE_CHANGED: &str = "locale-changed";

/// Prefix of topics carrying server push notifications
pub const NOTIFICATION_PREFIX: &str = "notification-";

/// Topic under which a server push of the given message type is broadcast
pub fn notification_topic(msg_type: &str) -> String {
    format!("{}{}", NOTIFICATION_PREFIX, msg_type)
}
