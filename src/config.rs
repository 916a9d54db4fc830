//! Process configuration: listener addresses, logging and bridge tuning.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use remote_bridge::BridgeConfig;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const BIND_ENV: &str = "SOULBRIDGE_BIND";
pub const METRICS_PORT_ENV: &str = "SOULBRIDGE_METRICS_PORT";
pub const MAX_IN_FLIGHT_ENV: &str = "SOULBRIDGE_MAX_IN_FLIGHT";
pub const DEFAULT_TIMEOUT_ENV: &str = "SOULBRIDGE_DEFAULT_TIMEOUT_MS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Address the bridge listens on for browser connections and callers.
    pub bind: SocketAddr,
    /// Prometheus exporter port; 0 disables it.
    pub metrics_port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub bridge: BridgeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8790)),
            metrics_port: 9090,
            log_level: "info".to_string(),
            log_json: false,
            bridge: BridgeConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.bridge
            .validate()
            .context("invalid bridge configuration")
    }

    /// Applies `SOULBRIDGE_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| env::var(key).ok())
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(BIND_ENV) {
            self.bind = raw
                .trim()
                .parse()
                .with_context(|| format!("{BIND_ENV} is not a socket address: {raw}"))?;
        }
        if let Some(raw) = lookup(METRICS_PORT_ENV) {
            self.metrics_port = raw
                .trim()
                .parse()
                .with_context(|| format!("{METRICS_PORT_ENV} is not a port: {raw}"))?;
        }
        if let Some(raw) = lookup(MAX_IN_FLIGHT_ENV) {
            self.bridge.max_in_flight_per_tenant = raw
                .trim()
                .parse()
                .with_context(|| format!("{MAX_IN_FLIGHT_ENV} is not a number: {raw}"))?;
        }
        if let Some(raw) = lookup(DEFAULT_TIMEOUT_ENV) {
            self.bridge.default_timeout_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("{DEFAULT_TIMEOUT_ENV} is not a number: {raw}"))?;
        }
        Ok(())
    }
}

pub struct LoadedConfig {
    pub config: Config,
    pub path: PathBuf,
    /// False when no file existed at `path` and defaults were used.
    pub from_file: bool,
}

/// Default lookup: `./config/bridge.yaml`, then `<config dir>/soulbridge/bridge.yaml`.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from("config/bridge.yaml");
    if local.exists() {
        return local;
    }
    match dirs::config_dir() {
        Some(mut path) => {
            path.push("soulbridge");
            path.push("bridge.yaml");
            path
        }
        None => local,
    }
}

pub async fn load_config(config_path: Option<&Path>) -> Result<LoadedConfig> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    // runs before logging is installed; the caller reports where config came from
    let from_file = path.exists();
    let mut config = if from_file {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?
    } else {
        Config::default()
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(LoadedConfig {
        config,
        path,
        from_file,
    })
}
