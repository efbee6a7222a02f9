// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Borealis trade engine. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_exchange_info_refresh_secs() -> u64 {
    60
}

fn default_clock_check_secs() -> u64 {
    60
}

fn default_max_clock_skew_ms() -> i64 {
    999
}

fn default_listen_key_keepalive_secs() -> u64 {
    1800
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Engine-wide settings loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding the trade database and config file.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Listen address for the observer API.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Binance REST base URL.
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    /// Binance WebSocket stream base URL.
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    /// Interval between exchange-info snapshot refreshes.
    #[serde(default = "default_exchange_info_refresh_secs")]
    pub exchange_info_refresh_secs: u64,

    /// Interval between exchange clock-skew checks.
    #[serde(default = "default_clock_check_secs")]
    pub clock_check_secs: u64,

    /// Clock difference above which a warning notice is broadcast.
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: i64,

    /// Interval between user-data-stream listen-key keepalives.
    #[serde(default = "default_listen_key_keepalive_secs")]
    pub listen_key_keepalive_secs: u64,

    /// Initial reconnect backoff for the user-data stream.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Reconnect backoff ceiling for the user-data stream.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            exchange_info_refresh_secs: default_exchange_info_refresh_secs(),
            clock_check_secs: default_clock_check_secs(),
            max_clock_skew_ms: default_max_clock_skew_ms(),
            listen_key_keepalive_secs: default_listen_key_keepalive_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            bind_addr = %config.bind_addr,
            data_dir = %config.data_dir,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Path of the SQLite database inside the data directory.
    pub fn database_url(&self) -> String {
        format!("sqlite://{}/borealis.db", self.data_dir)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.bind_addr, "127.0.0.1:3001");
        assert_eq!(cfg.rest_base_url, "https://api.binance.com");
        assert_eq!(cfg.exchange_info_refresh_secs, 60);
        assert_eq!(cfg.max_clock_skew_ms, 999);
        assert_eq!(cfg.listen_key_keepalive_secs, 1800);
        assert_eq!(cfg.reconnect_max_delay_ms, 60_000);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.data_dir, "data");
        assert_eq!(cfg.clock_check_secs, 60);
        assert_eq!(cfg.reconnect_base_delay_ms, 1000);
    }

    #[test]
    fn database_url_points_into_data_dir() {
        let mut cfg = RuntimeConfig::default();
        cfg.data_dir = "/tmp/borealis-test".to_string();
        assert_eq!(cfg.database_url(), "sqlite:///tmp/borealis-test/borealis.db");
    }
}
