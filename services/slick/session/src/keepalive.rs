//! Application-level PING/PONG liveness.
//!
//! The client pings on a fixed interval while connected and records every
//! pong. A connection whose last pong is older than the pong timeout is
//! considered dead.

use parking_lot::Mutex;
use slick_wire::Envelope;
use std::time::Duration;
use tokio::time::Instant;

/// Build a PING envelope
pub fn build_ping(message_id: u64) -> Envelope {
    Envelope::ping(message_id)
}

/// Build a PONG envelope answering the PING with `message_id`
pub fn build_pong(message_id: u64) -> Envelope {
    Envelope::pong(message_id)
}

/// Tracks when the peer last proved it was alive
#[derive(Debug)]
pub struct Liveness {
    last_pong: Mutex<Instant>,
    pong_timeout: Duration,
}

impl Liveness {
    /// Create a tracker considering the peer alive as of now
    pub fn new(pong_timeout: Duration) -> Self {
        Self {
            last_pong: Mutex::new(Instant::now()),
            pong_timeout,
        }
    }

    /// Treat the peer as alive as of now (fresh connection)
    pub fn reset(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    /// Record a pong
    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last pong (or reset)
    pub fn since_last_pong(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Whether the pong timeout has been exceeded
    pub fn is_stale(&self) -> bool {
        self.since_last_pong() > self.pong_timeout
    }
}
