//! Configuration file support
//!
//! Loads configuration from ~/.config/httptcpinfo/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerDefaults,

    #[serde(default)]
    pub probe: ProbeDefaults,
}

/// Default settings for `serve`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerDefaults {
    /// Listen port
    pub port: Option<u16>,

    /// Listen address (overrides the family's wildcard address)
    pub bind: Option<String>,

    /// Address family preference (ipv4, ipv6, dual)
    pub address_family: Option<String>,

    /// Also serve on this Unix-domain socket
    pub unix_socket: Option<PathBuf>,

    /// Indent JSON responses
    pub pretty: Option<bool>,

    /// Log file path (e.g., "~/.config/httptcpinfo/server.log")
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

/// Default settings for `probe`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProbeDefaults {
    /// Default target port
    pub port: Option<u16>,

    /// Print JSON instead of the text table
    pub json: Option<bool>,

    /// Connect timeout (e.g., "5s")
    pub timeout: Option<String>,

    /// Address family preference (ipv4, ipv6, dual)
    pub address_family: Option<String>,

    /// Log file path
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("httptcpinfo")
            .join("config.toml")
    }
}
