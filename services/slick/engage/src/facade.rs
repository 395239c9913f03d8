//! The engagement facade.
//!
//! [`Engagement`] builds the session descriptor for one page load, shares a
//! single `ensure_session` attempt between callers, applies server push
//! notifications to the session state and exposes the domain actions as
//! requests over the transport client.

use crate::activity::{ActivityReporter, ActivityTracker};
use crate::error::EngageError;
use crate::http::{Beacon, HttpClient};
use crate::identity;
use crate::page::PageContext;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use slick_bus::{topics, MessageBus, SubscriptionToken};
use slick_session::{
    ClientConfig, Connector, PageSummary, RequestError, SessionDescriptor, SessionError,
    SessionIdentity, SessionState, TransportClient, Visibility,
};
use slick_storage::Stores;
use slick_wire::{msg_type, now_ms};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Locale used until the server reports a session language
pub const DEFAULT_LOCALE: &str = "en";

/// Timeout for slow bulk requests (browsing)
pub const BULK_TIMEOUT: Duration = Duration::from_secs(60);

/// What happens to optimistic session changes when their request fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimisticPolicy {
    /// Leave the optimistic change in place
    #[default]
    KeepOnFailure,
    /// Undo the change and re-broadcast the session
    RevertOnFailure,
}

/// Facade configuration
#[derive(Debug, Clone)]
pub struct EngagementConfig {
    /// Site identifier
    pub site: String,
    /// Client version reported in handshakes
    pub client_version: String,
    /// Teardown endpoint; no teardown report without one
    pub beacon_url: Option<String>,
    /// Maximum age of a usable navigation hint
    pub navigation_freshness: Duration,
    /// Quiet period between the first activity report and interval reports
    pub activity_debounce: Duration,
    /// Interval between activity reports
    pub activity_interval: Duration,
    /// Failure handling of optimistic updates
    pub optimistic_policy: OptimisticPolicy,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            site: String::new(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            beacon_url: None,
            navigation_freshness: Duration::from_secs(30),
            activity_debounce: Duration::from_secs(5),
            activity_interval: Duration::from_secs(30),
            optimistic_policy: OptimisticPolicy::default(),
        }
    }
}

/// External services the facade is wired to
pub struct Collaborators {
    /// Opens physical connections
    pub connector: Arc<dyn Connector>,
    /// Event bus shared with the embedding application
    pub bus: MessageBus,
    /// Durable and session-scoped stores
    pub stores: Stores,
    /// Fire-and-forget teardown delivery
    pub beacon: Arc<dyn Beacon>,
    /// Fallback teardown delivery
    pub http: HttpClient,
}

type EnsureFuture = Shared<BoxFuture<'static, Result<SessionState, SessionError>>>;

struct EngageInner {
    config: EngagementConfig,
    page: PageContext,
    client: TransportClient,
    bus: MessageBus,
    stores: Stores,
    tracker: Arc<ActivityTracker>,
    reporter: ActivityReporter,
    beacon: Arc<dyn Beacon>,
    http: HttpClient,
    locale: RwLock<String>,
    ensure: Mutex<Option<(u64, EnsureFuture)>>,
    next_ticket: AtomicU64,
    subscriptions: Mutex<Vec<(String, SubscriptionToken)>>,
}

/// Session facade for one page load, cheap to clone
#[derive(Clone)]
pub struct Engagement {
    inner: Arc<EngageInner>,
}

impl Engagement {
    /// Resolve the reader identity and navigation hint, build the session
    /// descriptor and wire up the transport client. Does not connect.
    pub async fn start(
        config: EngagementConfig,
        client_config: ClientConfig,
        page: PageContext,
        deps: Collaborators,
    ) -> Result<Self, EngageError> {
        let durable = deps.stores.durable.as_ref();
        let reader = identity::reader_id(durable).await?;
        let hint = identity::take_navigation_hint(durable, config.navigation_freshness).await?;

        let mut descriptor = SessionDescriptor::new(SessionIdentity {
            site: config.site.clone(),
            reader,
            start: now_ms(),
            client_version: config.client_version.clone(),
        });
        descriptor.details = page.session_details();
        if let Some(hint) = hint {
            debug!("Arrived from {}", hint.url);
            descriptor = descriptor.with_detail("priorPage", json!(hint.url));
        }

        let client = TransportClient::new(
            client_config,
            descriptor,
            deps.connector,
            deps.bus.clone(),
        );
        let tracker = Arc::new(ActivityTracker::new());
        client.set_activity_source(tracker.clone());
        let reporter = ActivityReporter::new(
            client.clone(),
            tracker.clone(),
            config.activity_debounce,
            config.activity_interval,
        );

        let inner = Arc::new(EngageInner {
            config,
            page,
            client,
            bus: deps.bus,
            stores: deps.stores,
            tracker,
            reporter,
            beacon: deps.beacon,
            http: deps.http,
            locale: RwLock::new(DEFAULT_LOCALE.to_string()),
            ensure: Mutex::new(None),
            next_ticket: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
        });
        inner.subscribe_push(msg_type::HEARTS_ADDED, apply_hearts_added);
        inner.subscribe_push(msg_type::VISITOR_ARRIVED, apply_visitor_arrived);
        inner.subscribe_push(msg_type::VISITOR_LEFT, apply_visitor_left);

        info!(
            "Engagement ready for {} (reader {})",
            inner.page.url,
            inner.client.identity().reader
        );
        Ok(Self { inner })
    }

    /// Return the live session, establishing it if needed. Concurrent
    /// callers share one attempt; success also applies the session language.
    pub async fn ensure_session(&self) -> Result<SessionState, EngageError> {
        let attempt = self.inner.ensure_attempt();
        Ok(attempt.await?)
    }

    /// Give hearts to the current page
    pub async fn add_hearts(&self, count: u64) -> Result<Value, EngageError> {
        self.ensure_session().await?;
        let url = self.inner.page.effective_url().to_string();

        self.inner.optimistic(|s| adjust_hearts(s, count, true));
        let result = self
            .inner
            .client
            .request(msg_type::HEART, json!({ "url": url, "hearts": count }), None)
            .await;
        self.inner.settle(result, |s| adjust_hearts(s, count, false))
    }

    /// Remove a page from the reader's favorites
    pub async fn remove_favorite(&self, url: &str) -> Result<Value, EngageError> {
        self.ensure_session().await?;

        let removed = self
            .inner
            .client
            .update_session(|s| remove_favorite_entry(s, url));
        self.inner.client.announce_session();

        let result = self
            .inner
            .client
            .request(msg_type::DELETE_FAVORITE, json!({ "url": url }), None)
            .await;
        self.inner.settle(result, |s| {
            if let Some(removed) = removed {
                restore_favorite_entry(s, url, removed);
            }
        })
    }

    /// Full-text search
    pub async fn search(&self, query: &str) -> Result<Value, EngageError> {
        self.call(msg_type::SEARCH, json!({ "query": query }), None)
            .await
    }

    /// The reader's favorites. A well-formed list replaces the one in the
    /// session state.
    pub async fn get_favorites(&self) -> Result<Value, EngageError> {
        let reply = self.call(msg_type::LIST_FAVORITES, json!({}), None).await?;

        let listed = reply
            .get("favorites")
            .cloned()
            .and_then(|v| serde_json::from_value::<Vec<PageSummary>>(v).ok());
        if let Some(favorites) = listed {
            self.inner.optimistic(move |s| {
                s.favorite_count = favorites.len() as u64;
                s.favorites = favorites;
            });
        }
        Ok(reply)
    }

    /// Popular pages
    pub async fn get_popular(&self) -> Result<Value, EngageError> {
        self.call(msg_type::LIST_RECOMMENDED_POPULAR, json!({}), None)
            .await
    }

    /// Newest pages
    pub async fn get_latest(&self) -> Result<Value, EngageError> {
        self.call(msg_type::LIST_RECOMMENDED_NEW, json!({}), None)
            .await
    }

    /// Pages related to `url`
    pub async fn get_related(&self, url: &str) -> Result<Value, EngageError> {
        self.call(
            msg_type::LIST_RECOMMENDED_RELATED,
            json!({ "url": url }),
            None,
        )
        .await
    }

    /// Open a browsing session with the given filter
    pub async fn browse_start(&self, filter: Value) -> Result<Value, EngageError> {
        self.call(msg_type::BROWSE_START, filter, Some(BULK_TIMEOUT))
            .await
    }

    /// Change the filter of the open browsing session
    pub async fn browse_change(&self, filter: Value) -> Result<Value, EngageError> {
        self.call(msg_type::BROWSE_CHANGE, filter, Some(BULK_TIMEOUT))
            .await
    }

    /// Start a membership change
    pub async fn set_membership(&self, membership: Value) -> Result<Value, EngageError> {
        self.call(msg_type::SET_MEMBERSHIP, membership, None).await
    }

    /// Confirm a pending membership change
    pub async fn confirm_membership(&self, confirmation: Value) -> Result<Value, EngageError> {
        self.call(msg_type::CONFIRM_MEMBERSHIP, confirmation, None)
            .await
    }

    /// Record the page being left so the next page load can report it
    pub async fn remember_navigation(&self, url: &str) -> Result<(), EngageError> {
        identity::remember_navigation(self.inner.stores.durable.as_ref(), url).await?;
        Ok(())
    }

    /// Note a reader interaction (scroll, click, key press)
    pub fn record_interaction(&self) {
        self.inner.reporter.record_interaction();
    }

    /// Forward a page visibility change
    pub async fn set_visibility(&self, visibility: Visibility) -> Result<(), EngageError> {
        let visible = visibility == Visibility::Visible;
        if !visible {
            self.inner.reporter.pause();
        }
        self.inner.client.set_visibility(visibility).await?;
        self.inner.tracker.set_visible(visible);
        Ok(())
    }

    /// Report a widget interaction
    pub fn widget_action(&self, name: &str, data: Value) -> u64 {
        self.inner.client.notify(
            msg_type::WIDGET_ACTION,
            json!({ "name": name, "url": self.inner.page.url, "data": data }),
        )
    }

    /// Report a page-level interaction
    pub fn page_action(&self, name: &str, data: Value) -> u64 {
        self.inner.client.notify(
            msg_type::PAGE_ACTION,
            json!({ "name": name, "url": self.inner.page.url, "data": data }),
        )
    }

    /// Tear the session down: report unreported engagement (beacon, or a
    /// POST if beacons are unavailable) and shut the transport down
    pub async fn unload(&self) -> Result<(), EngageError> {
        let inner = &self.inner;
        inner.reporter.pause();
        inner.unsubscribe_all();

        let reported = match inner.config.beacon_url.as_deref() {
            Some(url) => inner.send_teardown(url).await,
            None => Ok(()),
        };
        inner.client.shutdown();
        info!("Engagement for {} unloaded", inner.page.url);
        reported
    }

    /// Current locale code
    pub fn locale(&self) -> String {
        self.inner.locale.read().clone()
    }

    /// Snapshot of the session state
    pub fn session(&self) -> Option<SessionState> {
        self.inner.client.session()
    }

    /// The underlying transport client
    pub fn client(&self) -> &TransportClient {
        &self.inner.client
    }

    /// The page this facade serves
    pub fn page(&self) -> &PageContext {
        &self.inner.page
    }

    async fn call(
        &self,
        kind: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, EngageError> {
        self.ensure_session().await?;
        Ok(self.inner.client.request(kind, payload, timeout).await?)
    }
}

impl std::fmt::Debug for Engagement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engagement")
            .field("url", &self.inner.page.url)
            .field("locale", &self.locale())
            .field("client", &self.inner.client)
            .finish()
    }
}

impl EngageInner {
    fn ensure_attempt(self: &Arc<Self>) -> EnsureFuture {
        let mut slot = self.ensure.lock();
        if let Some((_, inflight)) = slot.as_ref() {
            return inflight.clone();
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let inner = self.clone();
        let task = tokio::spawn(async move {
            let result = inner.client.ensure_session().await;
            if let Ok(state) = &result {
                inner.apply_language(state.language.as_deref());
            }
            inner.finish_ensure(ticket);
            result
        });
        let shared = async move {
            task.await.unwrap_or_else(|e| {
                warn!("Session task failed: {}", e);
                Err(SessionError::Superseded)
            })
        }
        .boxed()
        .shared();

        *slot = Some((ticket, shared.clone()));
        shared
    }

    fn finish_ensure(&self, ticket: u64) {
        let mut slot = self.ensure.lock();
        if matches!(slot.as_ref(), Some((t, _)) if *t == ticket) {
            *slot = None;
        }
    }

    fn apply_language(&self, language: Option<&str>) {
        let locale = normalize_locale(language);
        let changed = {
            let mut current = self.locale.write();
            if *current == locale {
                false
            } else {
                *current = locale.clone();
                true
            }
        };
        if changed {
            info!("Locale switched to {}", locale);
            self.bus
                .dispatch(topics::LOCALE_CHANGED, json!({ "locale": locale }));
        }
    }

    /// Mutate the session and broadcast the change
    fn optimistic(&self, f: impl FnOnce(&mut SessionState)) {
        if self.client.update_session(f).is_some() {
            self.client.announce_session();
        }
    }

    fn settle(
        &self,
        result: Result<Value, RequestError>,
        revert: impl FnOnce(&mut SessionState),
    ) -> Result<Value, EngageError> {
        match result {
            Ok(reply) => Ok(reply),
            Err(e) => {
                match self.config.optimistic_policy {
                    OptimisticPolicy::KeepOnFailure => {
                        warn!("Request failed, keeping optimistic update: {}", e);
                    }
                    OptimisticPolicy::RevertOnFailure => {
                        warn!("Request failed, reverting optimistic update: {}", e);
                        self.optimistic(revert);
                    }
                }
                Err(e.into())
            }
        }
    }

    fn subscribe_push(self: &Arc<Self>, kind: &str, apply: fn(&mut SessionState, &Value) -> bool) {
        let topic = topics::notification_topic(kind);
        let weak = Arc::downgrade(self);
        let token = self.bus.subscribe(&topic, move |payload| {
            if let Some(inner) = weak.upgrade() {
                let changed = inner
                    .client
                    .update_session(|state| apply(state, payload))
                    .unwrap_or(false);
                if changed {
                    inner.client.announce_session();
                }
            }
            Ok(())
        });
        self.subscriptions.lock().push((topic, token));
    }

    fn unsubscribe_all(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for (topic, token) in subscriptions {
            self.bus.unsubscribe(&topic, token);
        }
    }

    async fn send_teardown(&self, url: &str) -> Result<(), EngageError> {
        let activity = self.tracker.take();
        let identity = self.client.identity();
        let body = json!({
            "site": identity.site,
            "reader": identity.reader,
            "start": identity.start,
            "engagedMs": activity.engaged_ms,
        });

        if self.beacon.send_beacon(url, &body) {
            debug!("Teardown beacon queued for {}", url);
            return Ok(());
        }
        warn!("Beacon unavailable, posting teardown report");
        self.http.post(url, &body).await?;
        Ok(())
    }
}

impl Drop for EngageInner {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

/// Primary subtag of a language code, lowercased; the default locale when
/// absent
pub fn normalize_locale(language: Option<&str>) -> String {
    language
        .and_then(|l| l.split(['-', '_']).next())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_LOCALE.to_string())
}

fn adjust_hearts(state: &mut SessionState, count: u64, add: bool) {
    if add {
        state.reader_hearts = state.reader_hearts.saturating_add(count);
    } else {
        state.reader_hearts = state.reader_hearts.saturating_sub(count);
    }
    if let Some(page) = state.current_page.as_mut() {
        if add {
            page.total_hearts = page.total_hearts.saturating_add(count);
        } else {
            page.total_hearts = page.total_hearts.saturating_sub(count);
        }
    }
}

/// What an optimistic favorite removal changed
#[derive(Debug)]
struct RemovedFavorite {
    position: Option<(usize, PageSummary)>,
    page_unfavorited: bool,
}

fn remove_favorite_entry(state: &mut SessionState, url: &str) -> RemovedFavorite {
    let position = state
        .favorites
        .iter()
        .position(|f| f.url == url)
        .map(|i| (i, state.favorites.remove(i)));

    let mut page_unfavorited = false;
    if let Some(page) = state.current_page.as_mut() {
        if page.url == url && page.favorited {
            page.favorited = false;
            page.total_favorites = page.total_favorites.saturating_sub(1);
            page_unfavorited = true;
        }
    }
    if position.is_some() || page_unfavorited {
        state.favorite_count = state.favorite_count.saturating_sub(1);
    }
    RemovedFavorite {
        position,
        page_unfavorited,
    }
}

fn restore_favorite_entry(state: &mut SessionState, url: &str, removed: RemovedFavorite) {
    let restored = removed.position.is_some() || removed.page_unfavorited;
    if let Some((index, entry)) = removed.position {
        let index = index.min(state.favorites.len());
        state.favorites.insert(index, entry);
    }
    if removed.page_unfavorited {
        if let Some(page) = state.current_page.as_mut().filter(|p| p.url == url) {
            page.favorited = true;
            page.total_favorites = page.total_favorites.saturating_add(1);
        }
    }
    if restored {
        state.favorite_count = state.favorite_count.saturating_add(1);
    }
}

fn apply_hearts_added(state: &mut SessionState, payload: &Value) -> bool {
    let Some(url) = payload.get("url").and_then(Value::as_str) else {
        return false;
    };
    let hearts = payload.get("hearts").and_then(Value::as_u64).unwrap_or(1);
    match state.current_page.as_mut() {
        Some(page) if page.url == url => {
            page.total_hearts = page.total_hearts.saturating_add(hearts);
            true
        }
        _ => false,
    }
}

fn apply_visitor_arrived(state: &mut SessionState, payload: &Value) -> bool {
    state.active_visitors = match payload.get("activeVisitors").and_then(Value::as_u64) {
        Some(count) => count,
        None => state.active_visitors.saturating_add(1),
    };
    true
}

fn apply_visitor_left(state: &mut SessionState, payload: &Value) -> bool {
    state.active_visitors = match payload.get("activeVisitors").and_then(Value::as_u64) {
        Some(count) => count,
        None => state.active_visitors.saturating_sub(1),
    };
    true
}
