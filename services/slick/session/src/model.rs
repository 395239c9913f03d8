//! Server-assigned session state.
//!
//! Only the fields the client reads or mutates are typed; everything else
//! the server sends is kept in `extra` so nothing is lost when the state is
//! re-broadcast.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// State of one logical session as last reported by the server, plus any
/// optimistic local changes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    /// The page the reader is on
    pub current_page: Option<PageState>,
    /// Recommended pages
    pub recommended: Vec<PageSummary>,
    /// The reader's favorites
    pub favorites: Vec<PageSummary>,
    /// Total number of favorites of the reader
    pub favorite_count: u64,
    /// Hearts the reader has given in total
    pub reader_hearts: u64,
    /// Visitors currently on the site
    pub active_visitors: u64,
    /// Feature flags
    pub features: Map<String, Value>,
    /// Session language as a locale code
    pub language: Option<String>,
    /// Untyped server fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Current page information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageState {
    /// Canonical page URL
    pub url: String,
    /// Page title
    pub title: Option<String>,
    /// Hearts given to the page by everyone
    pub total_hearts: u64,
    /// Times the page was favorited
    pub total_favorites: u64,
    /// Whether the reader has this page in favorites
    pub favorited: bool,
    /// Untyped server fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Summary of a page in lists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageSummary {
    /// Page URL
    pub url: String,
    /// Page title
    pub title: Option<String>,
    /// Hearts given to the page
    pub total_hearts: u64,
    /// Untyped server fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Volatile fields returned by `restart-session`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartReply {
    /// Visitors currently on the site
    pub active_visitors: Option<u64>,
    /// Current page counters
    pub current_page: Option<RestartPage>,
}

/// Current page counters in a restart reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartPage {
    /// Hearts given to the page by everyone
    pub total_hearts: Option<u64>,
    /// Times the page was favorited
    pub total_favorites: Option<u64>,
}

impl SessionState {
    /// Apply the volatile fields of a restart reply, keeping everything else
    pub fn merge_restart(&mut self, reply: &RestartReply) {
        if let Some(visitors) = reply.active_visitors {
            self.active_visitors = visitors;
        }
        if let (Some(page), Some(update)) = (self.current_page.as_mut(), &reply.current_page) {
            if let Some(favorites) = update.total_favorites {
                page.total_favorites = favorites;
            }
            if let Some(hearts) = update.total_hearts {
                page.total_hearts = hearts;
            }
        }
    }

    /// Whether `url` is the current page
    pub fn is_current_page(&self, url: &str) -> bool {
        self.current_page
            .as_ref()
            .map(|p| p.url == url)
            .unwrap_or(false)
    }

    /// JSON form for broadcasting
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
