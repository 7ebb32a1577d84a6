// src/config.rs

//! Manages manager configuration: loading and defaulting.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

/// The manager's configuration file (`berylmgr.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bind address of the admin listener.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// The manager's own address as the cluster sees it; pushed into
    /// coordinator HBA rules when the cluster lock has to open access.
    #[serde(default = "default_manager_address")]
    pub manager_address: String,

    /// The administrative database used for every manager connection.
    #[serde(default = "default_db")]
    pub default_db: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub switcher: SwitcherConfig,
}

/// The `[switcher]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct SwitcherConfig {
    /// Tick interval of the switcher's working loop.
    #[serde(with = "humantime_serde", default = "default_switch_interval")]
    pub switch_interval: Duration,

    /// Accept data loss during failover: fall through to async slaves and
    /// candidates whose serving port is down.
    #[serde(default)]
    pub force_switch: bool,

    /// The additional operator token allowing promotion past a dead agent.
    #[serde(default)]
    pub force_confirm: bool,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self {
            switch_interval: default_switch_interval(),
            force_switch: false,
            force_confirm: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7432
}

fn default_manager_address() -> String {
    "127.0.0.1".to_string()
}

fn default_db() -> String {
    "postgres".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_switch_interval() -> Duration {
    Duration::from_millis(2000)
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading configuration from \"{path}\""))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing configuration from \"{path}\""))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            manager_address: default_manager_address(),
            default_db: default_db(),
            log_level: default_log_level(),
            switcher: SwitcherConfig::default(),
        }
    }
}
