//! Message type strings carried in the envelope `msgType` field.

/// Full session establishment handshake
pub const START_SESSION: &str = "start-session";
/// Lightweight handshake resuming an existing session after reconnect
pub const RESTART_SESSION: &str = "restart-session";

/// Add hearts to the current page
pub const HEART: &str = "heart";
/// Remove a page from the reader's favorites
pub const DELETE_FAVORITE: &str = "delete-favorite";
/// Full text search
pub const SEARCH: &str = "search";
/// List the reader's favorites
pub const LIST_FAVORITES: &str = "list-favorites";
/// List popular pages
pub const LIST_RECOMMENDED_POPULAR: &str = "list-recommended-popular";
/// List newest pages
pub const LIST_RECOMMENDED_NEW: &str = "list-recommended-new";
/// List pages related to the current one
pub const LIST_RECOMMENDED_RELATED: &str = "list-recommended-related";
/// Open a browse panel
pub const BROWSE_START: &str = "browse-start";
/// Change the browse panel selection
pub const BROWSE_CHANGE: &str = "browse-change";
/// Start a membership change
pub const SET_MEMBERSHIP: &str = "set-membership";
/// Confirm a membership change
pub const CONFIRM_MEMBERSHIP: &str = "confirm-membership";

/// Periodic engagement report
pub const ACTIVITY: &str = "activity";
/// Page-level action report
pub const PAGE_ACTION: &str = "page-action";
/// Widget-level action report
pub const WIDGET_ACTION: &str = "widget-action";
/// Teardown notice sent before closing the connection
pub const CLOSING: &str = "closing";

/// Server push: hearts added to a page
pub const HEARTS_ADDED: &str = "hearts-added";
/// Server push: a visitor arrived on the site
pub const VISITOR_ARRIVED: &str = "visitor-arrived";
/// Server push: a visitor left the site
pub const VISITOR_LEFT: &str = "visitor-left";
