//! Configuration handling for the slick binary.
//!
//! Reads the YAML config file, falls back to defaults when it is missing or
//! unreadable, then applies `SLICK_*` environment overrides.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use slick_engage::{EngagementConfig, OptimisticPolicy};
use slick_session::ClientConfig;
use slick_storage::StoreMode;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Transport settings, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub endpoint: String,
    pub request_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub throttle_after_failures: u32,
    pub throttle_ticks: u32,
    pub connect_timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            endpoint: defaults.endpoint,
            request_timeout_ms: defaults.request_timeout.as_millis() as u64,
            ping_interval_ms: defaults.ping_interval.as_millis() as u64,
            pong_timeout_ms: defaults.pong_timeout.as_millis() as u64,
            retry_interval_ms: defaults.retry_interval.as_millis() as u64,
            throttle_after_failures: defaults.throttle_after_failures,
            throttle_ticks: defaults.throttle_ticks,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Facade settings, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngagementSection {
    pub site: String,
    pub client_version: String,
    pub beacon_url: Option<String>,
    pub navigation_freshness_ms: u64,
    pub activity_debounce_ms: u64,
    pub activity_interval_ms: u64,
    pub optimistic_policy: OptimisticPolicy,
}

impl Default for EngagementSection {
    fn default() -> Self {
        let defaults = EngagementConfig::default();
        Self {
            site: defaults.site,
            client_version: defaults.client_version,
            beacon_url: defaults.beacon_url,
            navigation_freshness_ms: defaults.navigation_freshness.as_millis() as u64,
            activity_debounce_ms: defaults.activity_debounce.as_millis() as u64,
            activity_interval_ms: defaults.activity_interval.as_millis() as u64,
            optimistic_policy: defaults.optimistic_policy,
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// `memory` or `file`
    pub mode: String,
    pub data_dir: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            mode: "memory".to_string(),
            data_dir: "./slickdata".to_string(),
        }
    }
}

/// Root of the config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlickConfig {
    pub client: ClientSection,
    pub engagement: EngagementSection,
    pub storage: StorageSection,
}

impl SlickConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<SlickConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();

        info!(
            "Final configuration: endpoint={}, site={}, storage={}",
            config.client.endpoint, config.engagement.site, config.storage.mode
        );
        Ok(config)
    }

    /// Apply `SLICK_*` environment variables
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("SLICK_ENDPOINT") {
            info!("Endpoint overridden by environment: {}", endpoint);
            self.client.endpoint = endpoint;
        }
        if let Some(site) = lookup("SLICK_SITE") {
            info!("Site overridden by environment: {}", site);
            self.engagement.site = site;
        }
        if let Some(version) = lookup("SLICK_CLIENT_VERSION") {
            self.engagement.client_version = version;
        }
        if let Some(dir) = lookup("SLICK_STORAGE_DIR") {
            info!("Storage directory overridden by environment: {}", dir);
            self.storage.mode = "file".to_string();
            self.storage.data_dir = dir;
        }
        if let Some(url) = lookup("SLICK_BEACON_URL") {
            self.engagement.beacon_url = Some(url).filter(|u| !u.is_empty());
        }
    }

    /// Transport client settings
    pub fn client_config(&self) -> ClientConfig {
        let c = &self.client;
        ClientConfig {
            endpoint: c.endpoint.clone(),
            request_timeout: Duration::from_millis(c.request_timeout_ms),
            ping_interval: Duration::from_millis(c.ping_interval_ms),
            pong_timeout: Duration::from_millis(c.pong_timeout_ms),
            retry_interval: Duration::from_millis(c.retry_interval_ms),
            throttle_after_failures: c.throttle_after_failures,
            throttle_ticks: c.throttle_ticks,
        }
    }

    /// Timeout for opening the websocket
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.client.connect_timeout_ms)
    }

    /// Facade settings
    pub fn engagement_config(&self) -> EngagementConfig {
        let e = &self.engagement;
        EngagementConfig {
            site: e.site.clone(),
            client_version: e.client_version.clone(),
            beacon_url: e.beacon_url.clone(),
            navigation_freshness: Duration::from_millis(e.navigation_freshness_ms),
            activity_debounce: Duration::from_millis(e.activity_debounce_ms),
            activity_interval: Duration::from_millis(e.activity_interval_ms),
            optimistic_policy: e.optimistic_policy,
        }
    }

    /// Durable store backend
    pub fn store_mode(&self) -> Result<StoreMode> {
        match self.storage.mode.as_str() {
            "memory" => Ok(StoreMode::InMemory),
            "file" => Ok(StoreMode::File {
                data_dir: self.storage.data_dir.clone(),
            }),
            other => anyhow::bail!("Invalid storage mode: {}. Use 'memory' or 'file'", other),
        }
    }
}
