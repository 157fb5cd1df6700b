//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: KV_PLUGIN_, `__` separates sections)
//! 2. File named by `KV_PLUGIN_CONFIG`
//! 3. XDG config directory: ~/.config/kv-plugin/config.toml
//! 4. System directory: /etc/kv-plugin/config.toml
//! 5. Default values
//!
//! Host-protocol variables (`PLUGIN_*`) are not configuration; see
//! [`crate::negotiation`].

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::handshake::Transport;

/// Environment variable that points at an explicit config file
pub const CONFIG_PATH_ENV: &str = "KV_PLUGIN_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Plugin identity and protocol settings
    pub plugin: PluginConfig,

    /// Listener settings
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Backing store for the KV service
    #[serde(default)]
    pub store: StoreConfig,
}

/// Plugin-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Health registry entry marked SERVING at startup
    #[serde(default = "default_health_service")]
    pub health_service: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// App protocol versions this plugin can speak
    #[serde(default = "default_app_protocol_versions")]
    pub app_protocol_versions: Vec<u32>,

    /// Environment variable the host must set before launching us
    #[serde(default)]
    pub magic_cookie_key: Option<String>,

    /// Expected value of `magic_cookie_key`
    #[serde(default)]
    pub magic_cookie_value: Option<String>,
}

/// Endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Listener transport
    #[serde(default)]
    pub transport: Transport,

    /// Host name bound and advertised for the tcp transport
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the tcp transport (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory for the unix socket (defaults to the system temp dir)
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,

    /// How long in-flight calls may run after shutdown begins
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Back-off between liveness reads after a transient stdin error
    #[serde(default = "default_liveness_poll_ms")]
    pub liveness_poll_ms: u64,
}

impl EndpointConfig {
    /// Get the shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Get the liveness poll interval as Duration
    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            host: default_host(),
            port: default_port(),
            socket_dir: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            liveness_poll_ms: default_liveness_poll_ms(),
        }
    }
}

/// Store backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// One file per key
    #[default]
    File,
    /// Process-local map
    Memory,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the file backend
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            dir: default_store_dir(),
        }
    }
}

fn default_health_service() -> String {
    "plugin".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_app_protocol_versions() -> Vec<u32> {
    vec![1]
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1234
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_liveness_poll_ms() -> u64 {
    1000
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Config {
    /// Load configuration from all sources
    pub fn load() -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Lowest priority first so later files override earlier ones
        for path in Self::find_config_paths().iter().rev() {
            if path.exists() {
                tracing::debug!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("KV_PLUGIN_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// Environment variables still override the file.
    pub fn load_from(path: &str) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("KV_PLUGIN_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Config file candidates, highest priority first
    fn find_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            paths.push(PathBuf::from(path));
        }

        let xdg_dirs = xdg::BaseDirectories::with_prefix("kv-plugin");
        if let Some(path) = xdg_dirs.find_config_file("config.toml") {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc/kv-plugin/config.toml"));

        paths
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.plugin.app_protocol_versions.is_empty() {
            return Err(Error::Config(Box::new(figment::Error::from(
                "plugin.app_protocol_versions cannot be empty".to_string(),
            ))));
        }

        if self.plugin.app_protocol_versions.contains(&0) {
            return Err(Error::Config(Box::new(figment::Error::from(
                "plugin.app_protocol_versions entries must be at least 1".to_string(),
            ))));
        }

        if self.plugin.magic_cookie_key.is_some() != self.plugin.magic_cookie_value.is_some() {
            return Err(Error::Config(Box::new(figment::Error::from(
                "plugin.magic_cookie_key and plugin.magic_cookie_value must be set together"
                    .to_string(),
            ))));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugin: PluginConfig {
                health_service: default_health_service(),
                log_level: default_log_level(),
                app_protocol_versions: default_app_protocol_versions(),
                magic_cookie_key: None,
                magic_cookie_value: None,
            },
            endpoint: EndpointConfig::default(),
            store: StoreConfig::default(),
        }
    }
}
