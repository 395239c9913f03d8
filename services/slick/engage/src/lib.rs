//! Engagement facade for slick.
//!
//! Wraps the transport session client with page-level semantics: the
//! session descriptor for one page load, the persistent reader identity, the
//! prior-page hint, domain actions with optimistic session updates, staged
//! activity reporting and the unload teardown report.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod activity;
pub mod error;
pub mod facade;
pub mod http;
pub mod identity;
pub mod page;

pub use activity::{ActivityReport, ActivityReporter, ActivityTracker, Stage};
pub use error::EngageError;
pub use facade::{
    normalize_locale, Collaborators, Engagement, EngagementConfig, OptimisticPolicy,
    BULK_TIMEOUT, DEFAULT_LOCALE,
};
pub use http::{Beacon, HttpBeacon, HttpClient, HttpError};
pub use identity::{NavigationHint, NAVIGATION_HINT_KEY, READER_KEY};
pub use page::{DisplaySize, NavigationTiming, PageContext};
