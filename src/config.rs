//! Client configuration loading.
//!
//! Reads `config.json` from the platform config directory (if present) and
//! applies `SESSIONWIRE_*` environment overrides on top of the defaults.
//!
//! Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants;

/// Configuration for the session layer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the backend server.
    pub server_url: String,
    /// Path that record POSTs are sent to.
    pub api_path: String,
    /// Path of the shared WebSocket endpoint.
    pub ws_path: String,
    /// Number of physical HTTP channels per server.
    pub pool_size: usize,
    /// Per-call timeout in seconds.
    pub request_timeout_secs: u64,
    /// Probe timeout in seconds.
    pub probe_timeout_secs: u64,
    /// Tickets requested per refill.
    pub tickets_request_count: u32,
    /// Ask for more tickets once fewer than this many remain.
    pub tickets_min_count: usize,
    /// Safety margin subtracted from ticket lifetimes, in seconds.
    pub ticket_ttl_margin_secs: u64,
    /// Replenish once the newest ticket expires within this many seconds.
    pub ticket_horizon_threshold_secs: u64,
    /// Interval of the expired-ticket sweep, in seconds.
    pub ticket_sweep_interval_secs: u64,
    /// User-Agent sent on every HTTP request.
    pub user_agent: String,
    /// Extra headers sent on every HTTP request.
    pub headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            api_path: constants::DEFAULT_API_PATH.to_string(),
            ws_path: constants::DEFAULT_WS_PATH.to_string(),
            pool_size: constants::DEFAULT_POOL_SIZE,
            request_timeout_secs: constants::DEFAULT_REQUEST_TIMEOUT.as_secs(),
            probe_timeout_secs: constants::DEFAULT_PROBE_TIMEOUT.as_secs(),
            tickets_request_count: constants::DEFAULT_TICKETS_REQUEST,
            tickets_min_count: constants::DEFAULT_TICKETS_MIN,
            ticket_ttl_margin_secs: constants::MIN_TICKET_TTL_MARGIN.as_secs(),
            ticket_horizon_threshold_secs: constants::TICKET_HORIZON_THRESHOLD.as_secs(),
            ticket_sweep_interval_secs: constants::TICKET_SWEEP_INTERVAL.as_secs(),
            user_agent: format!("sessionwire/{}", env!("CARGO_PKG_VERSION")),
            headers: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    /// Returns the configuration directory path.
    ///
    /// `SESSIONWIRE_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("SESSIONWIRE_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("sessionwire"))
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from an explicit file without env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(server_url) = std::env::var("SESSIONWIRE_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Ok(pool_size) = std::env::var("SESSIONWIRE_POOL_SIZE") {
            if let Ok(size) = pool_size.parse::<usize>() {
                self.pool_size = size;
            }
        }

        if let Ok(timeout) = std::env::var("SESSIONWIRE_REQUEST_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.request_timeout_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("SESSIONWIRE_PROBE_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.probe_timeout_secs = secs;
            }
        }

        if let Ok(count) = std::env::var("SESSIONWIRE_TICKETS_REQUEST") {
            if let Ok(n) = count.parse::<u32>() {
                self.tickets_request_count = n;
            }
        }

        if let Ok(count) = std::env::var("SESSIONWIRE_TICKETS_MIN") {
            if let Ok(n) = count.parse::<usize>() {
                self.tickets_min_count = n;
            }
        }
    }

    /// Reject configurations the session layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be at least 1");
        }
        if self.api_path.is_empty() {
            anyhow::bail!("api_path must not be empty");
        }
        if self.tickets_request_count == 0 {
            anyhow::bail!("tickets_request_count must be at least 1");
        }
        Ok(())
    }

    /// Per-call timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Ticket lifetime safety margin.
    pub fn ticket_ttl_margin(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_margin_secs)
    }

    /// Ticket replenishment horizon.
    pub fn ticket_horizon_threshold(&self) -> Duration {
        Duration::from_secs(self.ticket_horizon_threshold_secs)
    }

    /// Expired-ticket sweep interval.
    pub fn ticket_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.ticket_sweep_interval_secs.max(1))
    }
}
