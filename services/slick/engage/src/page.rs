//! Page and environment details captured once per page load.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Viewport geometry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySize {
    /// Width in CSS pixels
    pub width: u32,
    /// Height in CSS pixels
    pub height: u32,
}

/// Navigation timing marks, epoch milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationTiming {
    /// Navigation started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation_start: Option<i64>,
    /// Last response byte received
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_end: Option<i64>,
    /// Document became interactive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom_interactive: Option<i64>,
    /// Load event finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_event_end: Option<i64>,
}

/// The page the reader is on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    /// Page URL
    pub url: String,
    /// Canonical URL declared by the page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    /// Page title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Referring URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    /// Publication timestamp as declared by the page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    /// Last update timestamp as declared by the page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    /// Viewport geometry
    pub display: DisplaySize,
    /// Navigation timing marks
    pub timing: NavigationTiming,
    /// Whether the reader is signed in
    pub authenticated: bool,
}

impl PageContext {
    /// Context for a bare URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// The URL the backend should attribute engagement to
    pub fn effective_url(&self) -> &str {
        self.canonical_url.as_deref().unwrap_or(&self.url)
    }

    /// Fields contributed to the `start-session` payload
    pub fn session_details(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(details)) => details,
            _ => Map::new(),
        }
    }
}
