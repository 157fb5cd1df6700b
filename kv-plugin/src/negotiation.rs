//! Host-supplied startup environment
//!
//! A host launching the plugin communicates through environment variables:
//! which app protocol versions it accepts, which ports or socket directory
//! to use, and an optional magic cookie proving the launch is intentional.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::PluginConfig;
use crate::error::{Error, Result};

/// Comma-separated app protocol versions the host accepts
pub const PROTOCOL_VERSIONS_ENV: &str = "PLUGIN_PROTOCOL_VERSIONS";
/// Lowest TCP port the plugin may bind
pub const MIN_PORT_ENV: &str = "PLUGIN_MIN_PORT";
/// Highest TCP port the plugin may bind
pub const MAX_PORT_ENV: &str = "PLUGIN_MAX_PORT";
/// Directory for unix sockets
pub const UNIX_SOCKET_DIR_ENV: &str = "PLUGIN_UNIX_SOCKET_DIR";

const NOT_A_PLUGIN_MESSAGE: &str = "This binary is a plugin. These are not meant to be executed directly.\n\
Please execute the program that consumes these plugins, which will\n\
load any plugins automatically";

/// Snapshot of the environment the host started us with
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    vars: HashMap<String, String>,
}

impl HostEnv {
    /// Capture the process environment
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit pairs
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Versions the host offered, highest first. Unparseable entries are skipped.
    pub fn host_versions(&self) -> Vec<u32> {
        let Some(raw) = self.get(PROTOCOL_VERSIONS_ENV) else {
            return Vec::new();
        };

        let mut versions: Vec<u32> = raw
            .split(',')
            .filter_map(|s| match s.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(value = %s, "host sent invalid plugin version");
                    None
                }
            })
            .collect();
        versions.sort_unstable_by(|a, b| b.cmp(a));
        versions
    }

    /// Pick the app protocol version to announce
    ///
    /// The newest version both sides support wins. Without a match the
    /// lowest supported version is returned and the host reports the
    /// incompatibility.
    pub fn negotiate_version(&self, supported: &[u32]) -> Result<u32> {
        let lowest = supported.iter().copied().min().ok_or_else(|| {
            Error::HostEnv("plugin supports no app protocol versions".to_string())
        })?;

        let offered = self.host_versions();
        let chosen = offered
            .iter()
            .copied()
            .find(|v| supported.contains(v))
            .unwrap_or(lowest);

        tracing::debug!(?offered, ?supported, chosen, "negotiated app protocol version");
        Ok(chosen)
    }

    /// Host-imposed TCP port range, if any
    pub fn port_range(&self) -> Result<Option<(u16, u16)>> {
        let min = self.get(MIN_PORT_ENV);
        let max = self.get(MAX_PORT_ENV);
        if min.is_none() && max.is_none() {
            return Ok(None);
        }

        let parse = |key: &str, value: Option<&str>| -> Result<u16> {
            match value {
                None => Ok(0),
                Some(v) => v.trim().parse().map_err(|e| {
                    Error::HostEnv(format!("Couldn't get value from {key}: {e}"))
                }),
            }
        };

        let min = parse(MIN_PORT_ENV, min)?;
        let max = parse(MAX_PORT_ENV, max)?;
        if min > max {
            return Err(Error::HostEnv(format!(
                "{MIN_PORT_ENV} value of {min} is greater than {MAX_PORT_ENV} value of {max}"
            )));
        }

        Ok(Some((min, max)))
    }

    /// Host-chosen directory for unix sockets
    pub fn unix_socket_dir(&self) -> Option<PathBuf> {
        self.get(UNIX_SOCKET_DIR_ENV).map(PathBuf::from)
    }

    /// Verify the magic cookie when the plugin is configured with one
    pub fn check_magic_cookie(&self, plugin: &PluginConfig) -> Result<()> {
        let (Some(key), Some(expected)) = (&plugin.magic_cookie_key, &plugin.magic_cookie_value)
        else {
            return Ok(());
        };

        if self.vars.get(key.as_str()) == Some(expected) {
            Ok(())
        } else {
            eprintln!("{NOT_A_PLUGIN_MESSAGE}");
            Err(Error::MagicCookie { key: key.clone() })
        }
    }
}
