//! Configuration handling for the WARP proxy

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// File name looked up in the working directory before the user config dir
pub const LOCAL_CONFIG_FILE: &str = "warp-proxy.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Overrides the per-user data directory holding binaries and profiles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub proxy: ProxySettings,
    pub http: HttpSettings,
    pub tools: ToolSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    pub host: String,
    pub socks_port: u16,
    /// Delay after spawning the proxy before `enable` reports success
    pub startup_grace_ms: u64,
    /// How long `stop` waits for the process to exit before a forced kill
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    pub user_agent: String,
    pub max_redirects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    pub registration: ToolSpec,
    pub proxy: ToolSpec,
}

/// An external executable fetched from a GitHub-style release feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub releases_url: String,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, releases_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            releases_url: releases_url.into(),
        }
    }

    /// On-disk file name of the executable for the current target
    pub fn executable_name(&self) -> String {
        format!("{}{}", self.name, std::env::consts::EXE_SUFFIX)
    }
}

impl ProxySettings {
    /// The HTTP listener always sits one port above the SOCKS5 listener
    ///
    /// [`Config::validate`] keeps `socks_port` below `u16::MAX`, so this
    /// never saturates for a validated config.
    pub fn http_port(&self) -> u16 {
        self.socks_port.saturating_add(1)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            proxy: ProxySettings {
                host: "127.0.0.1".to_string(),
                socks_port: 40000,
                startup_grace_ms: 1000,
                stop_timeout_ms: 3000,
            },
            http: HttpSettings {
                user_agent: concat!("warp-proxy/", env!("CARGO_PKG_VERSION")).to_string(),
                max_redirects: 10,
            },
            tools: ToolSettings {
                registration: ToolSpec::new(
                    "wgcf",
                    "https://api.github.com/repos/ViRb3/wgcf/releases/latest",
                ),
                proxy: ToolSpec::new(
                    "wireproxy",
                    "https://api.github.com/repos/pufferffish/wireproxy/releases/latest",
                ),
            },
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the proxy cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue("proxy.host is empty".to_string()));
        }
        // Port 0 would bind an ephemeral port; the HTTP listener needs socks_port + 1
        if self.proxy.socks_port == 0 || self.proxy.socks_port == u16::MAX {
            return Err(ConfigError::InvalidValue(format!(
                "proxy.socks_port must be between 1 and {}, got {}",
                u16::MAX - 1,
                self.proxy.socks_port
            )));
        }
        Ok(())
    }

    /// Load config from the default locations, falling back to defaults
    ///
    /// Looks at `./warp-proxy.toml` first, then `<config dir>/warp-proxy/config.toml`.
    pub fn discover() -> Result<Self, ConfigError> {
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::load(&local);
        }

        if let Some(user) = user_config_path() {
            if user.exists() {
                return Self::load(&user);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Directory holding the binaries, account, profile and proxy config
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

/// `<config dir>/warp-proxy/config.toml`, if the platform has a config dir
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("warp-proxy").join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("warp-proxy")
        .join("warp")
}
