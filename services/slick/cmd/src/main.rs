//! Slick engagement client binary.
//!
//! Opens a session for one page against the slick backend, keeps it alive
//! until interrupted, logs server pushes and reports the visit on exit.

use clap::Parser;
use slick_bus::{topics, MessageBus};
use slick_engage::{Collaborators, Engagement, HttpBeacon, HttpClient, PageContext};
use slick_session::WebSocketConnector;
use slick_storage::Stores;
use slick_wire::msg_type;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::SlickConfig;
use logging::SlickLogFormatter;

// Component logging macros are defined in logging.rs and available via #[macro_export]

/// Slick engagement client
#[derive(Parser, Debug)]
#[command(name = "slick", version, about = "Persistent engagement session for one page")]
struct Args {
    /// Page URL the session is opened for
    #[arg(long)]
    url: String,

    /// Page title
    #[arg(long)]
    title: Option<String>,

    /// Site identifier (overrides config)
    #[arg(long)]
    site: Option<String>,

    /// Websocket endpoint (overrides config)
    #[arg(long)]
    endpoint: Option<String>,

    /// Data directory for the durable store (switches storage to file mode)
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Ping interval, e.g. 30s (overrides config)
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,

    /// Add hearts to the page once the session is up
    #[arg(long)]
    hearts: Option<u64>,

    /// Run a search once the session is up
    #[arg(long)]
    search: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "slick.yaml")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("slick={}", args.log_level).parse()?)
        .add_directive(format!("slick_session={}", args.log_level).parse()?)
        .add_directive(format!("slick_engage={}", args.log_level).parse()?)
        .add_directive(format!("slick_wire={}", args.log_level).parse()?)
        .add_directive(format!("slick_bus={}", args.log_level).parse()?)
        .add_directive(format!("slick_storage={}", args.log_level).parse()?);

    let formatter = SlickLogFormatter::new("slick".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting slick client v{}", env!("CARGO_PKG_VERSION"));

    let mut slick_config = SlickConfig::load_from_file(&args.config)?;

    // Command line wins over file and environment
    if let Some(site) = &args.site {
        slick_config.engagement.site = site.clone();
    }
    if let Some(endpoint) = &args.endpoint {
        slick_config.client.endpoint = endpoint.clone();
    }
    if let Some(dir) = &args.storage_dir {
        slick_config.storage.mode = "file".to_string();
        slick_config.storage.data_dir = dir.to_string_lossy().to_string();
    }
    if let Some(interval) = args.ping_interval {
        slick_config.client.ping_interval_ms = Duration::from(interval).as_millis() as u64;
    }

    if slick_config.engagement.site.is_empty() {
        anyhow::bail!("No site configured (use --site, SLICK_SITE or engagement.site)");
    }

    let client_config = slick_config.client_config();
    let engagement_config = slick_config.engagement_config();
    let store_mode = slick_config.store_mode()?;

    info!(
        "Client config: endpoint={}, request_timeout={:?}, ping_interval={:?}, pong_timeout={:?}, storage={:?}",
        client_config.endpoint,
        client_config.request_timeout,
        client_config.ping_interval,
        client_config.pong_timeout,
        store_mode
    );

    let stores = Stores::from_mode(store_mode).await?;
    let bus = MessageBus::new();
    let http = HttpClient::with_timeout(Duration::from_secs(10));
    let deps = Collaborators {
        connector: Arc::new(WebSocketConnector::new(slick_config.connect_timeout())),
        bus: bus.clone(),
        stores,
        beacon: Arc::new(HttpBeacon::new(http.clone())),
        http,
    };

    let mut page = PageContext::new(args.url.clone());
    page.title = args.title.clone();

    subscribe_log_handlers(&bus);

    let engagement = Engagement::start(engagement_config, client_config, page, deps).await?;

    match engagement.ensure_session().await {
        Ok(session) => component_info!(
            "session",
            "Session established (language: {})",
            session.language.as_deref().unwrap_or("unknown")
        ),
        Err(e) => component_warn!(
            "session",
            "Initial session attempt failed: {}; retrying in background",
            e
        ),
    }
    engagement.record_interaction();

    if let Some(hearts) = args.hearts {
        match engagement.add_hearts(hearts).await {
            Ok(reply) => component_info!("engage", "Added {} hearts: {}", hearts, reply),
            Err(e) => component_warn!("engage", "Adding hearts failed: {}", e),
        }
    }
    if let Some(query) = &args.search {
        match engagement.search(query).await {
            Ok(results) => component_info!("engage", "Search '{}': {}", query, results),
            Err(e) => component_warn!("engage", "Search '{}' failed: {}", query, e),
        }
    }

    info!("Slick client started. Press Ctrl+C to leave the page");
    wait_for_shutdown().await?;

    info!("Leaving page, sending teardown report");
    if let Err(e) = engagement.remember_navigation(&args.url).await {
        warn!("Failed to remember navigation: {}", e);
    }
    if let Err(e) = engagement.unload().await {
        warn!("Unload failed: {}", e);
    }

    info!("Slick client shutdown complete");
    Ok(())
}

/// Log session lifecycle events and server pushes
fn subscribe_log_handlers(bus: &MessageBus) {
    bus.subscribe(topics::SESSION_UPDATED, |session| {
        component_debug!("session", "Session updated: {}", session);
        Ok(())
    });
    bus.subscribe(topics::SOCKET_CLOSED, |detail| {
        component_warn!("session", "Socket closed: {}", detail);
        Ok(())
    });
    bus.subscribe(topics::LOCALE_CHANGED, |locale| {
        component_info!("engage", "Locale changed to {}", locale);
        Ok(())
    });
    for push in [
        msg_type::HEARTS_ADDED,
        msg_type::VISITOR_ARRIVED,
        msg_type::VISITOR_LEFT,
    ] {
        bus.subscribe(&topics::notification_topic(push), move |payload| {
            component_info!("push", "{}: {}", push, payload);
            Ok(())
        });
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
            info!("Received SIGINT signal");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM signal");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
    info!("Received Ctrl+C");
    Ok(())
}
