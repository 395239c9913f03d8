//! Engagement accounting and staged activity reporting.
//!
//! [`ActivityTracker`] accumulates engaged (visible) time since the last
//! report. [`ActivityReporter`] turns the first interaction of a reporting
//! window into one immediate `activity` notify, waits out a debounce period
//! and then reports on a fixed interval until paused.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use slick_session::{ActivitySource, TransportClient};
use slick_wire::msg_type;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Engagement accumulated since the previous report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityReport {
    /// Visible time, milliseconds
    pub engaged_ms: u64,
    /// Interactions observed
    pub interactions: u64,
}

impl ActivityReport {
    /// JSON payload form
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug)]
struct Accumulator {
    unreported: Duration,
    visible_since: Option<Instant>,
    interactions: u64,
}

impl Accumulator {
    fn settle(&mut self, now: Instant) {
        if let Some(since) = self.visible_since {
            self.unreported += now.saturating_duration_since(since);
            self.visible_since = Some(now);
        }
    }
}

/// Accumulates engaged time while the page is visible
#[derive(Debug)]
pub struct ActivityTracker {
    state: Mutex<Accumulator>,
}

impl ActivityTracker {
    /// Start tracking a visible page
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Accumulator {
                unreported: Duration::ZERO,
                visible_since: Some(Instant::now()),
                interactions: 0,
            }),
        }
    }

    /// Count one reader interaction
    pub fn note_interaction(&self) {
        self.state.lock().interactions += 1;
    }

    /// Pause or resume time accumulation
    pub fn set_visible(&self, visible: bool) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.settle(now);
        state.visible_since = if visible { Some(now) } else { None };
    }

    /// Engaged time not yet reported
    pub fn unreported(&self) -> Duration {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state.unreported
    }

    /// Take the accumulated engagement, resetting the accumulator
    pub fn take(&self) -> ActivityReport {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        let report = ActivityReport {
            engaged_ms: state.unreported.as_millis() as u64,
            interactions: state.interactions,
        };
        state.unreported = Duration::ZERO;
        state.interactions = 0;
        report
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivitySource for ActivityTracker {
    fn take_unreported(&self) -> Value {
        self.take().to_value()
    }
}

/// Reporting stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the first interaction of a window
    Waiting,
    /// Initial report sent, debounce period running
    Debouncing,
    /// Reporting on a fixed interval
    Interval,
}

/// Drives `activity` notifies from interactions
#[derive(Debug)]
pub struct ActivityReporter {
    client: TransportClient,
    tracker: Arc<ActivityTracker>,
    debounce: Duration,
    interval: Duration,
    stage: Arc<Mutex<Stage>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityReporter {
    /// Create a reporter in the waiting stage
    pub fn new(
        client: TransportClient,
        tracker: Arc<ActivityTracker>,
        debounce: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            tracker,
            debounce,
            interval,
            stage: Arc::new(Mutex::new(Stage::Waiting)),
            task: Mutex::new(None),
        }
    }

    /// Current stage
    pub fn stage(&self) -> Stage {
        *self.stage.lock()
    }

    /// Note an interaction; the first one of a window starts reporting
    pub fn record_interaction(&self) {
        self.tracker.note_interaction();
        {
            let mut stage = self.stage.lock();
            if *stage != Stage::Waiting {
                return;
            }
            *stage = Stage::Debouncing;
        }

        debug!("Engagement detected, reporting activity");
        report(&self.client, &self.tracker);

        let client = self.client.clone();
        let tracker = self.tracker.clone();
        let stage = self.stage.clone();
        let (debounce, interval) = (self.debounce, self.interval);
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            *stage.lock() = Stage::Interval;
            loop {
                tokio::time::sleep(interval).await;
                report(&client, &tracker);
            }
        });
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop reporting; the next interaction starts a new window
    pub fn pause(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        *self.stage.lock() = Stage::Waiting;
    }
}

impl Drop for ActivityReporter {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

fn report(client: &TransportClient, tracker: &ActivityTracker) {
    let report = tracker.take();
    trace!("Reporting {}ms engaged", report.engaged_ms);
    client.notify(msg_type::ACTIVITY, report.to_value());
}

#[cfg(test)]
mod tests {
    use super::*;
    use slick_bus::MessageBus;
    use slick_session::{
        ClientConfig, LoopbackConnector, LoopbackPeer, SessionDescriptor, SessionIdentity,
    };
    use slick_wire::{Direction, Envelope};

    /// Next notify from the client, answering keepalive pings on the way
    async fn next_notify(peer: &mut LoopbackPeer) -> Envelope {
        loop {
            let env = peer.recv().await.unwrap();
            if env.direction == Direction::Notify {
                return env;
            }
            if env.direction == Direction::Ping {
                peer.send(&Envelope::pong(env.message_id));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_counts_visible_time_only() {
        let tracker = ActivityTracker::new();
        tokio::time::advance(Duration::from_secs(3)).await;
        tracker.set_visible(false);
        tokio::time::advance(Duration::from_secs(10)).await;
        tracker.set_visible(true);
        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.note_interaction();

        let report = tracker.take();
        assert_eq!(report.engaged_ms, 5_000);
        assert_eq!(report.interactions, 1);
        assert_eq!(tracker.take(), ActivityReport::default());
        assert_eq!(
            tracker.take_unreported(),
            serde_json::json!({ "engagedMs": 0, "interactions": 0 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_stages() {
        let connector = LoopbackConnector::new();
        let client = TransportClient::new(
            ClientConfig {
                endpoint: "ws://loopback/socket".into(),
                ..Default::default()
            },
            SessionDescriptor::new(SessionIdentity {
                site: "s".into(),
                reader: "1.r".into(),
                start: 1,
                client_version: "0.1.0".into(),
            }),
            Arc::new(connector.clone()),
            MessageBus::new(),
        );
        let server = {
            let connector = connector.clone();
            tokio::spawn(async move {
                let mut peer = connector.accept().await.unwrap();
                peer.answer_handshake(serde_json::json!({})).await.unwrap();
                peer
            })
        };
        client.ensure_session().await.unwrap();
        let mut peer = server.await.unwrap();

        let tracker = Arc::new(ActivityTracker::new());
        let reporter = ActivityReporter::new(
            client.clone(),
            tracker,
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let start = Instant::now();

        reporter.record_interaction();
        reporter.record_interaction();
        assert_eq!(reporter.stage(), Stage::Debouncing);

        let first = next_notify(&mut peer).await;
        assert_eq!(first.direction, Direction::Notify);
        assert_eq!(first.msg_type.as_deref(), Some("activity"));
        assert_eq!(first.payload["interactions"], 1);

        // Debounce then fixed interval: 35s, 65s
        let second = next_notify(&mut peer).await;
        assert_eq!(second.msg_type.as_deref(), Some("activity"));
        assert_eq!(second.payload["interactions"], 1);
        assert!(start.elapsed() >= Duration::from_secs(35));
        assert_eq!(reporter.stage(), Stage::Interval);

        let third = next_notify(&mut peer).await;
        let engaged = third.payload["engagedMs"].as_u64().unwrap();
        assert!((30_000..30_010).contains(&engaged));
        assert!(start.elapsed() >= Duration::from_secs(65));

        reporter.pause();
        assert_eq!(reporter.stage(), Stage::Waiting);
    }
}
