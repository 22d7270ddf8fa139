//! # Configuration Management Module
//!
//! This module holds the gateway configuration: the TOML file format, defaults, validation,
//! and the live-update handle shared by the long-running loops.
//!
//! ## Configuration Structure
//!
//! - [`GatewayConfig`] - Station identity, storage path, sweep interval, `/users` window and
//!   budget, repeater position
//! - [`BroadcastConfig`] - Periodic beacon toggle, interval and text
//! - [`EmergencyConfig`] - Emergency broadcast toggle, interval and text
//! - [`MeshtasticConfig`] - Device settings (informational, the transport is external)
//! - [`LoggingConfig`] - Logging level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshgate::config::{Config, ConfigHandle};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshgate.toml").await?;
//!     let handle = ConfigHandle::new(config);
//!
//!     // A dashboard flips the broadcast flag; loops see it on their next tick.
//!     handle.update(|cfg| cfg.broadcast.enabled = false);
//!     assert!(!handle.current().broadcast.enabled);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [gateway]
//! name = "Jonkoping Mesh Repeater"
//! database_path = "./data/nodedb"
//! sync_interval_secs = 7200
//! active_window_minutes = 10
//! repeater_latitude = 57.7826
//! repeater_longitude = 14.1618
//!
//! [broadcast]
//! enabled = true
//! interval_secs = 300
//! message = "Hello from the repeater!"
//!
//! [emergency]
//! enabled = false
//! interval_secs = 60
//! message = "Emergency: stay tuned on this channel"
//! ```
//!
//! ## Live Updates
//!
//! Configuration is never mutated field by field while a loop is running. [`ConfigHandle`]
//! publishes whole `Arc<Config>` snapshots through a `tokio::sync::watch` channel; each loop
//! takes one snapshot at the top of its tick and works from it until the next tick.

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::watch;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub emergency: EmergencyConfig,
    #[serde(default)]
    pub meshtastic: MeshtasticConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub name: String,
    /// Directory of the sled database holding the node registry and activity log.
    pub database_path: String,
    /// Seconds between reconciliation sweeps of the radio's live node table.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Window used by `/users` to decide who counts as recently active.
    #[serde(default = "default_active_window")]
    pub active_window_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeater_latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeater_longitude: Option<f64>,
    /// Character budget for a `/users` reply so it fits a single mesh frame.
    #[serde(default = "default_users_budget")]
    pub users_reply_budget: usize,
}

fn default_sync_interval() -> u64 {
    7200
}

fn default_active_window() -> u32 {
    10
}

/// Smallest `/users` budget that still fits the `Recent users: none` reply.
pub const MIN_USERS_REPLY_BUDGET: usize = 18;

fn default_users_budget() -> usize {
    200
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "meshgate Repeater".to_string(),
            database_path: "./data/nodedb".to_string(),
            sync_interval_secs: default_sync_interval(),
            active_window_minutes: default_active_window(),
            repeater_latitude: None,
            repeater_longitude: None,
            users_reply_budget: default_users_budget(),
        }
    }
}

impl GatewayConfig {
    /// Repeater reference coordinates, when both halves are configured.
    pub fn repeater_position(&self) -> Option<(f64, f64)> {
        match (self.repeater_latitude, self.repeater_longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Periodic beacon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub message: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 300,
            message: "Hello from the mesh repeater!".to_string(),
        }
    }
}

/// Emergency broadcast settings. When `enabled` flips, the scheduler switches mode on its next
/// tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub message: String,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 60,
            message: "Emergency broadcast".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshtasticConfig {
    pub port: String,
    #[serde(default)]
    pub channel: u32,
}

impl Default for MeshtasticConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            channel: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshgate.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        for problem in config.validate() {
            warn!("config {}: {}", path, problem);
        }
        Ok(config)
    }

    /// Write this configuration to a file
    pub async fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        Config::default().save(path).await
    }

    /// Repair values that would make a loop meaningless and report what was changed.
    ///
    /// Nothing here is fatal: a zero interval becomes one second, a half-configured repeater
    /// position is reported so `/distance` can answer with a clear reply instead.
    pub fn validate(&mut self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.broadcast.interval_secs == 0 {
            self.broadcast.interval_secs = 1;
            problems.push("broadcast.interval_secs was 0, using 1".to_string());
        }
        if self.emergency.interval_secs == 0 {
            self.emergency.interval_secs = 1;
            problems.push("emergency.interval_secs was 0, using 1".to_string());
        }
        if self.gateway.sync_interval_secs == 0 {
            self.gateway.sync_interval_secs = 1;
            problems.push("gateway.sync_interval_secs was 0, using 1".to_string());
        }
        if self.gateway.users_reply_budget < MIN_USERS_REPLY_BUDGET {
            problems.push(format!(
                "gateway.users_reply_budget was {}, using {}",
                self.gateway.users_reply_budget, MIN_USERS_REPLY_BUDGET
            ));
            self.gateway.users_reply_budget = MIN_USERS_REPLY_BUDGET;
        }
        if self.gateway.repeater_latitude.is_some() != self.gateway.repeater_longitude.is_some() {
            problems.push(
                "only one of repeater_latitude/repeater_longitude is set; /distance disabled"
                    .to_string(),
            );
        }
        if let Some(lat) = self.gateway.repeater_latitude {
            if !(-90.0..=90.0).contains(&lat) {
                self.gateway.repeater_latitude = None;
                problems.push(format!("repeater_latitude {} out of range; ignored", lat));
            }
        }
        if let Some(lon) = self.gateway.repeater_longitude {
            if !(-180.0..=180.0).contains(&lon) {
                self.gateway.repeater_longitude = None;
                problems.push(format!("repeater_longitude {} out of range; ignored", lon));
            }
        }
        problems
    }
}

/// Shared, swappable configuration snapshot.
///
/// Cloning the handle is cheap; all clones observe the same snapshots.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<Config>>>,
    rx: watch::Receiver<Arc<Config>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        let (tx, rx) = watch::channel(Arc::new(config));
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// The snapshot in effect right now.
    pub fn current(&self) -> Arc<Config> {
        self.rx.borrow().clone()
    }

    /// Copy the current snapshot, apply `edit`, and publish the result in one swap.
    pub fn update<F>(&self, edit: F)
    where
        F: FnOnce(&mut Config),
    {
        self.tx.send_modify(|current| {
            let mut next = Config::clone(current);
            edit(&mut next);
            *current = Arc::new(next);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();
        assert_eq!(config.broadcast.interval_secs, 300);
        assert_eq!(config.emergency.interval_secs, 60);
        assert_eq!(config.gateway.sync_interval_secs, 7200);
        assert_eq!(config.gateway.active_window_minutes, 10);
        assert_eq!(config.gateway.users_reply_budget, 200);
        assert!(config.gateway.repeater_position().is_none());
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let toml_text = r#"
            [gateway]
            name = "Test"
            database_path = "/tmp/x"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.gateway.name, "Test");
        assert_eq!(config.gateway.sync_interval_secs, 7200);
        assert!(!config.broadcast.enabled);
        assert!(!config.emergency.enabled);
    }

    #[test]
    fn test_validate_repairs_zero_intervals() {
        let mut config = Config::default();
        config.broadcast.interval_secs = 0;
        config.emergency.interval_secs = 0;
        let problems = config.validate();
        assert_eq!(problems.len(), 2);
        assert_eq!(config.broadcast.interval_secs, 1);
        assert_eq!(config.emergency.interval_secs, 1);
    }

    #[test]
    fn test_validate_raises_tiny_users_budget() {
        let mut config = Config::default();
        config.gateway.users_reply_budget = 10;
        let problems = config.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("users_reply_budget"));
        assert_eq!(config.gateway.users_reply_budget, MIN_USERS_REPLY_BUDGET);

        let mut config = Config::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.gateway.users_reply_budget, 200);
    }

    #[test]
    fn test_validate_reports_half_position() {
        let mut config = Config::default();
        config.gateway.repeater_latitude = Some(57.78);
        let problems = config.validate();
        assert_eq!(problems.len(), 1);
        assert!(config.gateway.repeater_position().is_none());
    }

    #[test]
    fn test_handle_update_swaps_whole_snapshot() {
        let handle = ConfigHandle::new(Config::default());
        let before = handle.current();
        handle.update(|cfg| {
            cfg.broadcast.enabled = true;
            cfg.broadcast.message = "beacon".to_string();
        });
        let after = handle.current();
        assert!(!before.broadcast.enabled);
        assert!(after.broadcast.enabled);
        assert_eq!(after.broadcast.message, "beacon");
    }

    #[test]
    fn test_config_toml_roundtrip_keeps_position() {
        let mut config = Config::default();
        config.gateway.repeater_latitude = Some(57.7826);
        config.gateway.repeater_longitude = Some(14.1618);
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.gateway.repeater_position(), Some((57.7826, 14.1618)));
    }
}
