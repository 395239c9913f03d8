//! Topic-keyed publish/subscribe registry

use dashmap::DashMap;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Outcome of one handler invocation
pub type HandlerResult = anyhow::Result<()>;

/// Subscriber callback
pub type Handler = Arc<dyn Fn(&Value) -> HandlerResult + Send + Sync>;

/// Opaque token identifying one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct BusInner {
    /// Handlers per topic, in registration order
    topics: DashMap<String, Vec<(SubscriptionToken, Handler)>>,
    /// Token allocator
    next_token: AtomicU64,
}

/// Process-wide event bus, cheap to clone
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler under a topic
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionToken
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        self.inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((token, Arc::new(handler)));
        debug!("Subscribed {:?} to topic {}", token, topic);
        token
    }

    /// Remove a handler, returning whether it was registered
    pub fn unsubscribe(&self, topic: &str, token: SubscriptionToken) -> bool {
        let removed = match self.inner.topics.get_mut(topic) {
            Some(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|(t, _)| *t != token);
                handlers.len() != before
            }
            None => false,
        };
        // Drop empty topics so the map does not grow with stale keys
        self.inner.topics.remove_if(topic, |_, handlers| handlers.is_empty());
        removed
    }

    /// Number of handlers currently registered for a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map(|h| h.len()).unwrap_or(0)
    }

    /// Invoke every handler of `topic` with `value`.
    ///
    /// Handlers run on their own tasks when a runtime is available, inline
    /// otherwise. Errors and panics are logged and never reach the caller.
    pub fn dispatch(&self, topic: &str, value: Value) {
        // Snapshot so handlers may (un)subscribe without deadlocking the shard
        let handlers: Vec<Handler> = match self.inner.topics.get(topic) {
            Some(entry) => entry.iter().map(|(_, h)| h.clone()).collect(),
            None => {
                trace!("No subscribers for topic {}", topic);
                return;
            }
        };

        debug!("Dispatching {} to {} handler(s)", topic, handlers.len());

        let value = Arc::new(value);
        let runtime = tokio::runtime::Handle::try_current().ok();
        for handler in handlers {
            let topic = topic.to_string();
            let value = value.clone();
            match &runtime {
                Some(handle) => {
                    handle.spawn(async move { invoke(&topic, &handler, &value) });
                }
                None => invoke(&topic, &handler, &value),
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("topics", &self.inner.topics.len())
            .finish()
    }
}

fn invoke(topic: &str, handler: &Handler, value: &Value) {
    match catch_unwind(AssertUnwindSafe(|| handler(value))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Handler for topic {} failed: {}", topic, e),
        Err(_) => error!("Handler for topic {} panicked", topic),
    }
}
