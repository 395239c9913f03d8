//! The transport session client.
//!
//! One [`TransportClient`] owns one physical connection at a time, performs
//! the session handshake on every (re)connect, correlates requests with
//! replies, keeps the link alive with PING/PONG and supervises reconnects.
//! Every connection attempt goes through a single shared slot so concurrent
//! callers never cause more than one handshake.

use crate::error::{RequestError, SessionError};
use crate::handshake::{self, SessionDescriptor, SessionIdentity};
use crate::keepalive::{self, Liveness};
use crate::model::SessionState;
use crate::pending::PendingRequests;
use crate::state::{Abandoned, ActiveLink, ConnectionState, Machine};
use crate::supervisor::{RetryThrottle, TickDecision};
use crate::transport::{Connector, Link};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use slick_bus::{topics, Debouncer, MessageBus};
use slick_wire::{msg_type, Direction, Envelope};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default backend endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://api.slick.example/socket";

/// Transport client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Websocket endpoint; the `site` query parameter is appended
    pub endpoint: String,
    /// Default timeout for requests, handshakes included
    pub request_timeout: Duration,
    /// Interval between PINGs while connected
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead
    pub pong_timeout: Duration,
    /// Reconnect supervisor tick interval
    pub retry_interval: Duration,
    /// Consecutive failures tolerated before retries are throttled
    pub throttle_after_failures: u32,
    /// While throttled, attempt only on every n-th supervisor tick
    pub throttle_ticks: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout: Duration::from_millis(8000),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(40),
            retry_interval: Duration::from_secs(5),
            throttle_after_failures: 2,
            throttle_ticks: 5,
        }
    }
}

impl ClientConfig {
    /// Endpoint URL with the `site` query parameter appended
    pub fn connection_url(&self, site: &str) -> Result<String, SessionError> {
        let mut url = url::Url::parse(&self.endpoint)
            .map_err(|e| SessionError::InvalidEndpoint(format!("{}: {}", self.endpoint, e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SessionError::InvalidEndpoint(format!(
                    "{}: unsupported scheme {}",
                    self.endpoint, other
                )))
            }
        }
        url.query_pairs_mut().append_pair("site", site);
        Ok(url.into())
    }
}

/// Visibility of the hosting page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Page is shown
    Visible,
    /// Page is in the background
    Hidden,
}

/// Supplies engagement not yet reported, sent with the closing notice
pub trait ActivitySource: Send + Sync {
    /// Take the unreported activity, resetting the accumulator
    fn take_unreported(&self) -> Value;
}

type AttemptFuture = Shared<BoxFuture<'static, Result<SessionState, SessionError>>>;

struct Inner {
    config: ClientConfig,
    descriptor: SessionDescriptor,
    connector: Arc<dyn Connector>,
    bus: MessageBus,
    machine: Mutex<Machine>,
    pending: PendingRequests,
    liveness: Liveness,
    throttle: Mutex<RetryThrottle>,
    session: RwLock<Option<SessionState>>,
    next_id: AtomicU64,
    /// In-flight connection attempt shared by every caller
    attempt: Mutex<Option<(u64, AttemptFuture)>>,
    next_ticket: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    hidden: AtomicBool,
    activity: RwLock<Option<Arc<dyn ActivitySource>>>,
    announce: Debouncer,
}

/// Persistent session client, cheap to clone
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl TransportClient {
    /// Create a disconnected client. Nothing happens until
    /// [`ensure_session`](Self::ensure_session) or
    /// [`reconnect`](Self::reconnect) is called.
    pub fn new(
        config: ClientConfig,
        descriptor: SessionDescriptor,
        connector: Arc<dyn Connector>,
        bus: MessageBus,
    ) -> Self {
        let throttle = RetryThrottle::new(config.throttle_after_failures, config.throttle_ticks);
        let liveness = Liveness::new(config.pong_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                descriptor,
                connector,
                bus,
                machine: Mutex::new(Machine::new()),
                pending: PendingRequests::new(),
                liveness,
                throttle: Mutex::new(throttle),
                session: RwLock::new(None),
                next_id: AtomicU64::new(1),
                attempt: Mutex::new(None),
                next_ticket: AtomicU64::new(1),
                supervisor: Mutex::new(None),
                hidden: AtomicBool::new(false),
                activity: RwLock::new(None),
                announce: Debouncer::new(Duration::ZERO),
            }),
        }
    }

    /// Return the live session, establishing it if needed.
    ///
    /// Concurrent callers share one attempt. On failure the retry
    /// supervisor is armed and the error is returned; call again to retry
    /// sooner.
    pub async fn ensure_session(&self) -> Result<SessionState, SessionError> {
        if let Some(state) = self.inner.live_session() {
            return Ok(state);
        }
        if self.inner.is_closed() {
            return Err(SessionError::Closed);
        }

        let result = self.inner.attempt().await;
        if let Err(e) = &result {
            warn!("Session establishment failed: {}", e);
            if e.is_retryable() {
                self.inner.start_supervisor();
            }
        }
        result
    }

    /// Reconnect now (`deferred == false`): stop the supervisor, reset the
    /// failure count, make one attempt and re-arm the supervisor whatever
    /// the outcome. With `deferred == true` only arm the supervisor.
    pub async fn reconnect(&self, deferred: bool) -> Result<(), SessionError> {
        self.inner.clone().reconnect(deferred).await
    }

    /// Send an envelope now if connected, otherwise queue it. Returns the
    /// message id used.
    pub fn send(
        &self,
        direction: Direction,
        msg_type: Option<&str>,
        payload: Value,
        message_id: Option<u64>,
    ) -> u64 {
        let id = message_id.unwrap_or_else(|| self.inner.next_message_id());
        self.inner
            .transmit(Envelope::new(direction, id, msg_type, payload));
        id
    }

    /// Fire-and-forget notification
    pub fn notify(&self, msg_type: &str, payload: Value) -> u64 {
        self.send(Direction::Notify, Some(msg_type), payload, None)
    }

    /// Send a request and wait for its reply, a server error or the timeout
    /// (the configured default when `timeout` is `None`)
    pub async fn request(
        &self,
        msg_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RequestError> {
        if self.inner.is_closed() {
            return Err(RequestError::NotConnected);
        }
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        let id = self.inner.next_message_id();
        let completion = self.inner.pending.register(id, msg_type)?;

        debug!("Request {} ({}) with timeout {:?}", id, msg_type, timeout);
        self.inner.transmit(Envelope::request(id, msg_type, payload));
        self.inner.pending.wait(id, completion, timeout).await
    }

    /// Close the connection, reconnectable later
    pub fn disconnect(&self) {
        self.inner.teardown(false);
    }

    /// Close the connection for good
    pub fn shutdown(&self) {
        self.inner.teardown(true);
    }

    /// React to the hosting page being hidden or shown
    pub async fn set_visibility(&self, visibility: Visibility) -> Result<(), SessionError> {
        match visibility {
            Visibility::Hidden => {
                self.inner.hidden.store(true, Ordering::SeqCst);
                match self.state() {
                    ConnectionState::Connecting
                    | ConnectionState::AwaitingHandshake
                    | ConnectionState::Connected => {
                        info!("Page hidden, pausing connection");
                        self.inner.teardown(false);
                    }
                    _ => self.inner.stop_supervisor(),
                }
                Ok(())
            }
            Visibility::Visible => {
                self.inner.hidden.store(false, Ordering::SeqCst);
                if self.is_connected() || self.inner.is_closed() {
                    return Ok(());
                }
                info!("Page visible, reconnecting");
                self.inner.clone().reconnect(false).await
            }
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        let supervising = self.inner.supervising();
        self.inner.machine.lock().state(supervising)
    }

    /// Whether a session is established on an open link
    pub fn is_connected(&self) -> bool {
        self.inner.machine.lock().is_connected()
    }

    /// Snapshot of the session state, if one was ever established
    pub fn session(&self) -> Option<SessionState> {
        self.inner.session.read().clone()
    }

    /// Mutate the session state in place. `None` if there is no session yet.
    pub fn update_session<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        self.inner.session.write().as_mut().map(f)
    }

    /// Broadcast `session-updated` on the next scheduler tick
    pub fn announce_session(&self) {
        self.inner.announce_session();
    }

    /// Number of requests awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether a request with this id awaits a reply
    pub fn has_pending(&self, message_id: u64) -> bool {
        self.inner.pending.contains(message_id)
    }

    /// Install the source of the closing notice payload
    pub fn set_activity_source(&self, source: Arc<dyn ActivitySource>) {
        *self.inner.activity.write() = Some(source);
    }

    /// Identity sent with every handshake
    pub fn identity(&self) -> &SessionIdentity {
        &self.inner.descriptor.identity
    }

    /// The bus events are published on
    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Consecutive failed connection attempts
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.throttle.lock().failures()
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl Inner {
    fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.machine.lock().is_closed()
    }

    fn live_session(&self) -> Option<SessionState> {
        if !self.machine.lock().is_connected() {
            return None;
        }
        self.session.read().clone()
    }

    fn supervising(&self) -> bool {
        self.supervisor
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Join the in-flight attempt or start a new one
    fn attempt(self: &Arc<Self>) -> AttemptFuture {
        let mut slot = self.attempt.lock();
        if let Some((_, inflight)) = slot.as_ref() {
            trace!("Joining in-flight connection attempt");
            return inflight.clone();
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let inner = self.clone();
        let task = tokio::spawn(async move {
            let result = inner.clone().reconnect_socket().await;
            inner.finish_attempt(ticket);
            result
        });
        let shared = async move {
            task.await.unwrap_or_else(|e| {
                warn!("Connection attempt task failed: {}", e);
                Err(SessionError::Superseded)
            })
        }
        .boxed()
        .shared();

        *slot = Some((ticket, shared.clone()));
        shared
    }

    fn finish_attempt(&self, ticket: u64) {
        let mut slot = self.attempt.lock();
        if matches!(slot.as_ref(), Some((t, _)) if *t == ticket) {
            *slot = None;
        }
    }

    fn attempt_in_flight(&self) -> bool {
        self.attempt.lock().is_some()
    }

    /// Open a fresh link and run the handshake on it
    async fn reconnect_socket(self: Arc<Self>) -> Result<SessionState, SessionError> {
        let begun = self.machine.lock().begin_connect();
        let Some((generation, previous)) = begun else {
            return Err(SessionError::Closed);
        };
        self.release(previous);

        let url = match self.config.connection_url(&self.descriptor.identity.site) {
            Ok(url) => url,
            Err(e) => {
                self.fail_attempt(generation);
                return Err(e);
            }
        };
        info!("Connecting to {}", url);

        let link = match self.connector.connect(&url).await {
            Ok(link) => link,
            Err(e) => {
                let failures = self.fail_attempt(generation);
                warn!("Connection attempt failed ({} consecutive): {}", failures, e);
                return Err(e.into());
            }
        };

        let Link { outbound, inbound } = link;
        let reader = tokio::spawn(read_loop(Arc::downgrade(&self), generation, inbound));
        let opened = self
            .machine
            .lock()
            .link_opened(generation, ActiveLink::new(outbound, reader));
        if let Err(link) = opened {
            debug!("Connection attempt {} superseded after open", generation);
            link.close();
            return Err(SessionError::Superseded);
        }
        self.liveness.reset();

        let resuming = self.session.read().is_some();
        let id = self.next_message_id();
        let request = if resuming {
            handshake::restart_request(id, &self.descriptor)
        } else {
            handshake::start_request(id, &self.descriptor)
        };

        let payload = match self.handshake(generation, request).await {
            Ok(payload) => payload,
            Err(e) => {
                let failures = self.fail_attempt(generation);
                warn!("Handshake failed ({} consecutive): {}", failures, e);
                return Err(e.into());
            }
        };

        let applied = if resuming {
            handshake::parse_restart_reply(payload).map(|reply| {
                if let Some(state) = self.session.write().as_mut() {
                    state.merge_restart(&reply);
                }
            })
        } else {
            handshake::parse_start_reply(payload).map(|state| {
                *self.session.write() = Some(state);
            })
        };
        if let Err(e) = applied {
            self.fail_attempt(generation);
            return Err(e);
        }

        let flushed = self.machine.lock().handshake_complete(generation);
        let Some(flushed) = flushed else {
            return Err(SessionError::Superseded);
        };
        self.throttle.lock().record_success();
        self.start_ping(generation);
        self.announce_session();

        info!(
            "Session {} (flushed {} queued message(s))",
            if resuming { "resumed" } else { "established" },
            flushed
        );
        Ok(self.session.read().clone().unwrap_or_default())
    }

    async fn handshake(&self, generation: u64, request: Envelope) -> Result<Value, RequestError> {
        let id = request.message_id;
        let text = slick_wire::encode(&request).map_err(|e| RequestError::Encode(e.to_string()))?;
        let completion = self.pending.register(id, request.msg_type_or_empty())?;

        let sent = self.machine.lock().send_handshake(generation, id, text);
        if !sent {
            self.pending.remove(id);
            return Err(RequestError::NotConnected);
        }
        debug!("Sent {} request {}", request.msg_type_or_empty(), id);

        self.pending
            .wait(id, completion, self.config.request_timeout)
            .await
    }

    /// Count a failed attempt and release whatever it opened. Attempts
    /// already superseded are not counted.
    fn fail_attempt(&self, generation: u64) -> u32 {
        let abandoned = self.machine.lock().abandon(generation);
        match abandoned {
            Some(abandoned) => {
                self.release(abandoned);
                self.throttle.lock().record_failure()
            }
            None => self.throttle.lock().failures(),
        }
    }

    /// Fail the handshake a dropped link was waiting for and close the link
    fn release(&self, abandoned: Abandoned) {
        if let Some(id) = abandoned.handshake_request {
            self.pending.reject(id, RequestError::NotConnected);
        }
        if let Some(link) = abandoned.link {
            debug!("Dropping previous connection");
            link.close();
        }
    }

    async fn reconnect(self: Arc<Self>, deferred: bool) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if deferred {
            self.start_supervisor();
            return Ok(());
        }

        self.stop_supervisor();
        self.throttle.lock().reset();
        let result = self.attempt().await.map(|_| ());
        if let Err(e) = &result {
            warn!("Immediate reconnect failed: {}", e);
        }
        if !self.is_closed() {
            self.start_supervisor();
        }
        result
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.reconnect(false).await {
                debug!("Background reconnect failed: {}", e);
            }
        });
    }

    fn start_supervisor(self: &Arc<Self>) {
        if self.hidden.load(Ordering::SeqCst) {
            debug!("Page hidden, not supervising reconnects");
            return;
        }
        self.throttle.lock().restart_ticks();
        let task = tokio::spawn(supervisor_loop(
            Arc::downgrade(self),
            self.config.retry_interval,
        ));
        let previous = self.supervisor.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!(
            "Reconnect supervisor armed (every {:?})",
            self.config.retry_interval
        );
    }

    fn stop_supervisor(&self) {
        let task = self.supervisor.lock().take();
        if let Some(task) = task {
            task.abort();
        }
    }

    fn start_ping(self: &Arc<Self>, generation: u64) {
        let task = tokio::spawn(ping_loop(
            Arc::downgrade(self),
            generation,
            self.config.ping_interval,
        ));
        self.machine.lock().set_ping_task(generation, task);
    }

    fn announce_session(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.announce.call(move || {
            if let Some(inner) = weak.upgrade() {
                let snapshot = inner
                    .session
                    .read()
                    .as_ref()
                    .map(SessionState::to_value)
                    .unwrap_or(Value::Null);
                inner.bus.dispatch(topics::SESSION_UPDATED, snapshot);
            }
        });
    }

    /// Encode and send or queue
    fn transmit(&self, envelope: Envelope) {
        match slick_wire::encode(&envelope) {
            Ok(text) => {
                let sent = self.machine.lock().send_or_queue(text);
                if sent {
                    trace!("Sent {} {}", envelope.direction, envelope.message_id);
                } else {
                    debug!(
                        "Queued {} {} until connected",
                        envelope.direction, envelope.message_id
                    );
                }
            }
            Err(e) => warn!("Dropping unencodable envelope {}: {}", envelope.message_id, e),
        }
    }

    /// Send on the open link of `generation` only
    fn send_direct(&self, generation: u64, envelope: Envelope) -> bool {
        match slick_wire::encode(&envelope) {
            Ok(text) => self.machine.lock().send_direct(generation, text),
            Err(e) => {
                warn!("Dropping unencodable envelope {}: {}", envelope.message_id, e);
                false
            }
        }
    }

    fn handle_frame(&self, generation: u64, text: &str) {
        let envelope = match slick_wire::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };
        let id = envelope.message_id;

        match envelope.direction {
            Direction::Response => {
                if !self.pending.resolve(id, envelope.payload) {
                    debug!("Ignoring response to unknown request {}", id);
                }
            }
            Direction::Error => {
                let description = envelope.error_description();
                if !self.pending.reject(id, RequestError::Server { description }) {
                    debug!("Ignoring error for unknown request {}", id);
                }
            }
            Direction::Ping => {
                trace!("PING {} from server", id);
                self.send_direct(generation, keepalive::build_pong(id));
            }
            Direction::Pong => {
                trace!("PONG {}", id);
                self.liveness.record_pong();
            }
            Direction::Notify => match envelope.msg_type.as_deref() {
                Some(kind) => {
                    debug!("Server notification {}", kind);
                    self.bus
                        .dispatch(&topics::notification_topic(kind), envelope.payload);
                }
                None => warn!("Dropping notification {} without a type", id),
            },
            Direction::Request => {
                warn!(
                    "Ignoring unsupported server request {} ({})",
                    id,
                    envelope.msg_type_or_empty()
                );
            }
        }
    }

    /// The link of `generation` went away without being asked to
    fn on_link_closed(self: &Arc<Self>, generation: u64) {
        let abandoned = self.machine.lock().abandon(generation);
        let Some(abandoned) = abandoned else {
            return;
        };
        self.release(abandoned);

        warn!("Connection closed by peer");
        self.bus
            .dispatch(topics::SOCKET_CLOSED, json!({ "reason": "peer-closed" }));

        if !self.hidden.load(Ordering::SeqCst) {
            self.start_supervisor();
        }
    }

    fn teardown(&self, terminal: bool) {
        self.stop_supervisor();

        let abandoned = {
            let mut machine = self.machine.lock();
            if terminal {
                machine.close()
            } else {
                machine.take_link()
            }
        };
        // Whatever attempt was running lost its link; later callers start afresh
        self.attempt.lock().take();
        if let Some(id) = abandoned.handshake_request {
            self.pending.reject(id, RequestError::NotConnected);
        }

        if let Some(link) = abandoned.link {
            let activity = self
                .activity
                .read()
                .as_ref()
                .map(|source| source.take_unreported())
                .unwrap_or_else(|| json!({}));
            let closing = Envelope::notify(self.next_message_id(), msg_type::CLOSING, activity);
            match slick_wire::encode(&closing) {
                Ok(text) => {
                    if !link.send_text(text) {
                        debug!("Link already gone, closing notice not sent");
                    }
                }
                Err(e) => warn!("Failed to encode closing notice: {}", e),
            }
            link.close();
            info!("Connection closed{}", if terminal { " for good" } else { "" });
        }

        let reason = if terminal { "shutdown" } else { "disconnect" };
        self.bus
            .dispatch(topics::SOCKET_CLOSED, json!({ "reason": reason }));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.get_mut().take() {
            task.abort();
        }
    }
}

async fn read_loop(weak: Weak<Inner>, generation: u64, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = inbound.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.handle_frame(generation, &text);
    }
    if let Some(inner) = weak.upgrade() {
        inner.on_link_closed(generation);
    }
}

async fn ping_loop(weak: Weak<Inner>, generation: u64, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.machine.lock().is_current(generation) {
            return;
        }
        if inner.liveness.is_stale() {
            warn!(
                "No PONG for {:?}, reconnecting",
                inner.liveness.since_last_pong()
            );
            inner.spawn_reconnect();
            return;
        }
        let id = inner.next_message_id();
        inner.send_direct(generation, keepalive::build_ping(id));
    }
}

async fn supervisor_loop(weak: Weak<Inner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.machine.lock().is_connected() {
            debug!("Connected, reconnect supervisor done");
            return;
        }
        if inner.is_closed() || inner.hidden.load(Ordering::SeqCst) {
            return;
        }
        if inner.attempt_in_flight() {
            trace!("Reconnect attempt in flight, skipping tick");
            continue;
        }
        let decision = inner.throttle.lock().tick();
        if decision == TickDecision::Throttled {
            continue;
        }

        if let Err(e) = inner.attempt().await {
            debug!("Supervised reconnect failed: {}", e);
        }
        if inner.machine.lock().is_connected() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackConnector, LoopbackPeer};
    use crate::transport::LinkFrame;
    use tokio::time::Instant;

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor::new(SessionIdentity {
            site: "site-1".into(),
            reader: "1718000000000.k3j9".into(),
            start: 1718000000000,
            client_version: "0.1.0".into(),
        })
        .with_detail("url", json!("https://example.org/a"))
    }

    fn client(connector: &LoopbackConnector) -> TransportClient {
        let config = ClientConfig {
            endpoint: "ws://loopback/socket".into(),
            ..Default::default()
        };
        TransportClient::new(
            config,
            descriptor(),
            Arc::new(connector.clone()),
            MessageBus::new(),
        )
    }

    fn session_reply() -> Value {
        json!({
            "currentPage": { "url": "https://example.org/a", "totalHearts": 4, "totalFavorites": 1 },
            "activeVisitors": 3,
            "language": "en"
        })
    }

    async fn connect(client: &TransportClient, connector: &LoopbackConnector) -> LoopbackPeer {
        let server = {
            let connector = connector.clone();
            tokio::spawn(async move {
                let mut peer = connector.accept().await.unwrap();
                peer.answer_handshake(session_reply()).await.unwrap();
                peer
            })
        };
        client.ensure_session().await.unwrap();
        server.await.unwrap()
    }

    fn topic_channel(bus: &MessageBus, topic: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(topic, move |v| {
            tx.send(v.clone())?;
            Ok(())
        });
        rx
    }

    #[test]
    fn test_connection_url() {
        let config = ClientConfig::default();
        assert_eq!(
            config.connection_url("my site").unwrap(),
            "wss://api.slick.example/socket?site=my+site"
        );

        let config = ClientConfig {
            endpoint: "ws://localhost:9000/ws?v=2".into(),
            ..Default::default()
        };
        assert_eq!(
            config.connection_url("s1").unwrap(),
            "ws://localhost:9000/ws?v=2&site=s1"
        );

        for bad in ["not a url", "https://api.slick.example/socket"] {
            let config = ClientConfig {
                endpoint: bad.into(),
                ..Default::default()
            };
            assert!(matches!(
                config.connection_url("s1"),
                Err(SessionError::InvalidEndpoint(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_concurrent_ensure_session_shares_one_handshake() {
        let connector = LoopbackConnector::new();
        let client = client(&connector);
        let mut updates = topic_channel(client.bus(), topics::SESSION_UPDATED);

        let server = {
            let connector = connector.clone();
            tokio::spawn(async move {
                let mut peer = connector.accept().await.unwrap();
                let request = peer.answer_handshake(session_reply()).await.unwrap();
                (peer, request)
            })
        };

        let (a, b) = tokio::join!(client.ensure_session(), client.ensure_session());
        let (mut peer, request) = server.await.unwrap();

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(request.msg_type.as_deref(), Some("start-session"));
        assert_eq!(request.payload["url"], "https://example.org/a");
        assert_eq!(request.payload["reader"], "1718000000000.k3j9");
        assert_eq!(connector.attempts(), 1);
        assert_eq!(connector.urls()[0], "ws://loopback/socket?site=site-1");
        assert_eq!(client.state(), ConnectionState::Connected);

        // Already connected: no new attempt
        client.ensure_session().await.unwrap();
        assert_eq!(connector.attempts(), 1);
        assert!(peer.try_recv_all().is_empty());

        let update = updates.recv().await.unwrap();
        assert_eq!(update["activeVisitors"], 3);
    }

    #[tokio::test]
    async fn test_request_ids_increase_and_replies_correlate() {
        let connector = LoopbackConnector::new();
        let client = client(&connector);
        let mut peer = connect(&client, &connector).await;

        let calls: Vec<_> = (0..5)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move { client.request("search", json!({ "q": i }), None).await })
            })
            .collect();

        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(peer.recv().await.unwrap());
        }
        let mut ids: Vec<u64> = received.iter().map(|e| e.message_id).collect();
        let sorted = {
            let mut s = ids.clone();
            s.sort_unstable();
            s.dedup();
            s
        };
        assert_eq!(sorted.len(), 5);
        ids.sort_unstable();
        assert_eq!(ids, sorted);

        // Reply in reverse order, echoing the query
        for env in received.iter().rev() {
            peer.send(&Envelope::new(
                Direction::Response,
                env.message_id,
                Some("search"),
                json!({ "echo": env.payload["q"] }),
            ));
        }

        for (i, call) in calls.into_iter().enumerate() {
            let reply = call.await.unwrap().unwrap();
            assert_eq!(reply["echo"], i as u64);
        }
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_removes_pending_and_ignores_late_reply() {
        let connector = LoopbackConnector::new();
        let client = client(&connector);
        let mut peer = connect(&client, &connector).await;

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.request("heart", json!({ "count": 1 }), None).await })
        };
        let request = peer.recv().await.unwrap();
        assert_eq!(request.direction, Direction::Request);
        assert!(client.has_pending(request.message_id));

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            RequestError::Timeout {
                id: request.message_id,
                timeout: Duration::from_millis(8000)
            }
        );
        assert!(!client.has_pending(request.message_id));

        // Late reply is dropped without disturbing the connection
        peer.send(&Envelope::new(
            Direction::Response,
            request.message_id,
            Some("heart"),
            json!({}),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.pending_requests(), 0);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_server_error_push_and_malformed_frames() {
        let connector = LoopbackConnector::new();
        let client = client(&connector);
        let mut hearts = topic_channel(client.bus(), "notification-hearts-added");
        let mut peer = connect(&client, &connector).await;

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.request("delete-favorite", json!({}), None).await })
        };
        let request = peer.recv().await.unwrap();

        peer.send_text("this is not json");
        peer.send(&Envelope::notify(900, "hearts-added", json!({ "hearts": 2 })));
        peer.send(&Envelope::new(
            Direction::Error,
            request.message_id,
            Some("delete-favorite"),
            json!({ "description": "not a favorite" }),
        ));

        assert_eq!(
            call.await.unwrap().unwrap_err(),
            RequestError::Server {
                description: "not a favorite".into()
            }
        );
        assert_eq!(hearts.recv().await.unwrap()["hearts"], 2);

        // Server PING is answered at once
        peer.send(&Envelope::ping(901));
        let pong = peer.recv().await.unwrap();
        assert_eq!(pong.direction, Direction::Pong);
        assert_eq!(pong.message_id, 901);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_queued_messages_flush_in_order() {
        let connector = LoopbackConnector::new();
        let client = client(&connector);

        for name in ["first", "second", "third"] {
            client.notify(msg_type::WIDGET_ACTION, json!({ "name": name }));
        }
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let mut peer = connect(&client, &connector).await;
        for name in ["first", "second", "third"] {
            let env = peer.recv().await.unwrap();
            assert_eq!(env.msg_type.as_deref(), Some("widget-action"));
            assert_eq!(env.payload["name"], name);
        }

        client.notify(msg_type::PAGE_ACTION, json!({ "name": "live" }));
        assert_eq!(peer.recv().await.unwrap().payload["name"], "live");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pong_triggers_reconnect() {
        let connector = LoopbackConnector::new();
        let client = client(&connector);
        let mut peer = connect(&client, &connector).await;
        let started = Instant::now();

        let ping = peer.recv().await.unwrap();
        assert_eq!(ping.direction, Direction::Ping);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));

        // Never answered: the next tick finds the link stale and reconnects
        let mut second = connector.accept().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(60));
        let restart = second
            .answer_handshake(json!({ "activeVisitors": 7 }))
            .await
            .unwrap();
        assert_eq!(restart.msg_type.as_deref(), Some("restart-session"));
        assert!(peer.recv().await.is_none());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(client.is_connected());
        assert_eq!(client.session().unwrap().active_visitors, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_pings_keep_connection() {
        let connector = LoopbackConnector::new();
        let client = client(&connector);
        let mut peer = connect(&client, &connector).await;

        for _ in 0..4 {
            let ping = peer.recv().await.unwrap();
            assert_eq!(ping.direction, Direction::Ping);
            peer.send(&Envelope::pong(ping.message_id));
        }
        assert_eq!(connector.attempts(), 1);
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_keeps_identity_and_merges_volatile_fields() {
        let connector = LoopbackConnector::new();
        let client = client(&connector);
        let mut closed = topic_channel(client.bus(), topics::SOCKET_CLOSED);

        let server = {
            let connector = connector.clone();
            tokio::spawn(async move {
                let mut peer = connector.accept().await.unwrap();
                let request = peer.answer_handshake(session_reply()).await.unwrap();
                (peer, request)
            })
        };
        client.ensure_session().await.unwrap();
        let (peer, first) = server.await.unwrap();

        // Optimistic change made while connected
        client.update_session(|s| s.reader_hearts = 11);

        drop(peer);
        assert_eq!(closed.recv().await.unwrap()["reason"], "peer-closed");
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        let mut second = connector.accept().await.unwrap();
        let restart = second
            .answer_handshake(json!({
                "activeVisitors": 9,
                "currentPage": { "totalFavorites": 6 }
            }))
            .await
            .unwrap();

        assert_eq!(restart.msg_type.as_deref(), Some("restart-session"));
        assert_eq!(restart.payload["reader"], first.payload["reader"]);
        assert_eq!(restart.payload["start"], first.payload["start"]);
        assert!(restart.payload.get("url").is_none());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = client.session().unwrap();
        assert!(client.is_connected());
        assert_eq!(state.active_visitors, 9);
        assert_eq!(state.reader_hearts, 11);
        let page = state.current_page.unwrap();
        assert_eq!(page.total_favorites, 6);
        assert_eq!(page.total_hearts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_throttling_spaces_out_attempts() {
        let connector = LoopbackConnector::new();
        connector.set_refuse(true);
        let client = client(&connector);
        let start = Instant::now();

        assert!(client.reconnect(false).await.is_err());
        assert_eq!(connector.attempts(), 1);
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        // Expected attempts at 0s, 5s, 10s, then every 25s
        let checkpoints = [
            (4_500, 1),
            (5_500, 2),
            (10_500, 3),
            (15_500, 3),
            (30_500, 3),
            (34_500, 3),
            (35_500, 4),
            (59_500, 4),
            (60_500, 5),
        ];
        for (at_ms, expected) in checkpoints {
            tokio::time::sleep_until(start + Duration::from_millis(at_ms)).await;
            assert_eq!(connector.attempts(), expected, "at {}ms", at_ms);
        }
        assert_eq!(client.consecutive_failures(), 5);

        // Backend comes back: the next permitted attempt connects
        connector.set_refuse(false);
        let server = {
            let connector = connector.clone();
            tokio::spawn(async move {
                let mut peer = connector.accept().await.unwrap();
                peer.answer_handshake(session_reply()).await.unwrap();
                peer
            })
        };
        let _peer = server.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(client.is_connected());
        assert_eq!(client.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_failed_ensure_session_arms_supervisor() {
        let connector = LoopbackConnector::new();
        connector.set_refuse(true);
        let client = client(&connector);

        let err = client.ensure_session().await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(client.state(), ConnectionState::Reconnecting);
    }

    struct FixedActivity;

    impl ActivitySource for FixedActivity {
        fn take_unreported(&self) -> Value {
            json!({ "engagedMs": 1234 })
        }
    }

    #[tokio::test]
    async fn test_visibility_pauses_and_resumes() {
        let connector = LoopbackConnector::new();
        let client = client(&connector);
        client.set_activity_source(Arc::new(FixedActivity));
        let mut closed = topic_channel(client.bus(), topics::SOCKET_CLOSED);
        let mut peer = connect(&client, &connector).await;

        client.set_visibility(Visibility::Hidden).await.unwrap();

        let closing = peer.recv_frame().await.unwrap();
        let LinkFrame::Text(text) = closing else {
            panic!("expected closing notice, got {:?}", closing);
        };
        let closing = slick_wire::decode(&text).unwrap();
        assert_eq!(closing.direction, Direction::Notify);
        assert_eq!(closing.msg_type.as_deref(), Some("closing"));
        assert_eq!(closing.payload["engagedMs"], 1234);
        assert_eq!(peer.recv_frame().await, Some(LinkFrame::Close));
        assert_eq!(closed.recv().await.unwrap()["reason"], "disconnect");
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let server = {
            let connector = connector.clone();
            tokio::spawn(async move {
                let mut peer = connector.accept().await.unwrap();
                let request = peer.answer_handshake(json!({})).await.unwrap();
                (peer, request)
            })
        };
        client.set_visibility(Visibility::Visible).await.unwrap();
        let (_peer, request) = server.await.unwrap();

        assert_eq!(connector.attempts(), 2);
        assert_eq!(request.msg_type.as_deref(), Some("restart-session"));
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_during_handshake_then_visible_reconnects_at_once() {
        let connector = LoopbackConnector::new();
        let client = client(&connector);

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.ensure_session().await })
        };
        let mut peer = connector.accept().await.unwrap();
        let handshake = peer.recv().await.unwrap();
        assert_eq!(handshake.msg_type.as_deref(), Some("start-session"));
        assert_eq!(client.state(), ConnectionState::AwaitingHandshake);

        // Hidden before the server answers: the attempt ends now, not at its timeout
        let hidden_at = Instant::now();
        client.set_visibility(Visibility::Hidden).await.unwrap();
        assert_eq!(
            first.await.unwrap().unwrap_err(),
            SessionError::Handshake(RequestError::NotConnected)
        );
        assert!(hidden_at.elapsed() < Duration::from_secs(1));
        assert!(!client.has_pending(handshake.message_id));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.consecutive_failures(), 0);

        let server = {
            let connector = connector.clone();
            tokio::spawn(async move {
                let mut peer = connector.accept().await.unwrap();
                let request = peer.answer_handshake(session_reply()).await.unwrap();
                (peer, request)
            })
        };
        let shown_at = Instant::now();
        client.set_visibility(Visibility::Visible).await.unwrap();
        let (_peer, request) = server.await.unwrap();

        assert!(shown_at.elapsed() < Duration::from_secs(1));
        assert_eq!(connector.attempts(), 2);
        assert_eq!(request.msg_type.as_deref(), Some("start-session"));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let connector = LoopbackConnector::new();
        let client = client(&connector);
        let mut peer = connect(&client, &connector).await;

        client.shutdown();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(peer.recv().await.unwrap().msg_type.as_deref(), Some("closing"));
        assert!(peer.recv().await.is_none());

        assert_eq!(client.ensure_session().await.unwrap_err(), SessionError::Closed);
        assert_eq!(client.reconnect(false).await.unwrap_err(), SessionError::Closed);
        assert_eq!(
            client.request("search", json!({}), None).await.unwrap_err(),
            RequestError::NotConnected
        );
        assert_eq!(connector.attempts(), 1);
    }
}
