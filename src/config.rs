//! Configuration for RangeSync

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Corrupt-data incidents before a mirror is blacklisted
pub const DEFAULT_MAX_URL_STRIKES: u32 = 3;

/// Byte ranges batched into a single request
pub const DEFAULT_MAX_RANGES_PER_REQUEST: usize = 100;

/// Redirect hops followed per request
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP connect timeout (seconds)
    pub connect_timeout_secs: u64,

    /// Corrupt-data strikes before a mirror is dropped
    pub max_url_strikes: u32,

    /// Maximum byte ranges per request; large gaps are fetched over
    /// several requests
    pub max_ranges_per_request: usize,

    /// Redirect hops followed per request
    pub max_redirects: usize,

    /// User-Agent header sent with every request
    pub user_agent: String,

    /// Show the progress bar
    pub progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            max_url_strikes: DEFAULT_MAX_URL_STRIKES,
            max_ranges_per_request: DEFAULT_MAX_RANGES_PER_REQUEST,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: format!("rangesync/{}", env!("CARGO_PKG_VERSION")),
            progress: true,
        }
    }
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| Error::io("reading config", e))?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("creating config dir", e))?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("serializing config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| Error::io("writing config", e))?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("rangesync").join("config.toml"))
            .ok_or_else(|| Error::config("could not determine config directory"))
    }
}
