//! Reader identity and the cross-navigation hint, both kept in the durable
//! store.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use slick_storage::{KeyValueStore, KeyValueStoreExt, StorageError};
use slick_wire::now_ms;
use std::time::Duration;
use tracing::{debug, info};

/// Storage key of the persistent reader identifier
pub const READER_KEY: &str = "slick.reader";
/// Storage key of the prior-page hint
pub const NAVIGATION_HINT_KEY: &str = "slick.navigation";

/// Where the reader navigated from, written just before leaving a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationHint {
    /// When the hint was written, epoch milliseconds
    pub at: i64,
    /// URL of the page being left
    pub url: String,
}

impl NavigationHint {
    /// Whether the hint was written less than `freshness` before `now_ms`
    pub fn is_fresh(&self, now_ms: i64, freshness: Duration) -> bool {
        let age = now_ms.saturating_sub(self.at);
        age >= 0 && (age as u128) < freshness.as_millis()
    }
}

fn generate_reader_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("{}.{}", now_ms(), suffix)
}

/// Look up the reader id, creating and persisting one on first use
pub async fn reader_id(store: &dyn KeyValueStore) -> Result<String, StorageError> {
    if let Some(existing) = store.get(READER_KEY).await? {
        if !existing.is_empty() {
            return Ok(existing);
        }
    }
    let reader = generate_reader_id();
    store.set(READER_KEY, &reader).await?;
    info!("Created reader id {}", reader);
    Ok(reader)
}

/// Record the page being left for the next page load
pub async fn remember_navigation(store: &dyn KeyValueStore, url: &str) -> Result<(), StorageError> {
    let hint = NavigationHint {
        at: now_ms(),
        url: url.to_string(),
    };
    store.set_json(NAVIGATION_HINT_KEY, &hint).await
}

/// Consume the prior-page hint. The stored hint is always removed; it is
/// returned only if still fresh. An unreadable hint counts as absent.
pub async fn take_navigation_hint(
    store: &dyn KeyValueStore,
    freshness: Duration,
) -> Result<Option<NavigationHint>, StorageError> {
    let hint = match store.get_json::<NavigationHint>(NAVIGATION_HINT_KEY).await {
        Ok(hint) => hint,
        Err(StorageError::Serialization(e)) => {
            debug!("Discarding unreadable navigation hint: {}", e);
            None
        }
        Err(e) => return Err(e),
    };
    store.delete(NAVIGATION_HINT_KEY).await?;

    Ok(hint.filter(|h| {
        let fresh = h.is_fresh(now_ms(), freshness);
        if !fresh {
            debug!("Ignoring stale navigation hint from {}", h.url);
        }
        fresh
    }))
}
