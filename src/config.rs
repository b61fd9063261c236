//! Runtime configuration for the browser environment and blocklist cache.
//!
//! Everything here has a working default; a TOML file only needs to exist
//! when the deployment has to pin a Chrome binary, tune settle delays, or
//! point at a different filter list. The worker process loads the same file,
//! so orchestrator and workers always agree.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::blocklist;

/// Environment variable naming an alternate config file, honored by both
/// the orchestrator and spawned workers.
pub const CONFIG_PATH_ENV: &str = "STACKPROBE_CONFIG";

/// Default configuration file path relative to the working directory.
pub const CONFIG_PATH: &str = "./config/stackprobe.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid URL in '{field}': {url}")]
    InvalidUrl { field: String, url: String },

    #[error("Configuration field '{field}' cannot be zero")]
    ZeroValue { field: String },
}

/// Root runtime configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub browser: BrowserConfig,
    pub blocklist: BlocklistConfig,
}

/// Browser launch environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Explicit Chrome binary; falls back to the CHROME_PATH env var, then
    /// to whatever the launcher discovers on its own.
    pub chrome_path: Option<String>,
    /// Force sandboxless launch even outside a detected container.
    pub force_no_sandbox: bool,
    /// Settle delay after navigation in full (non-simple) mode, standing in
    /// for a network-idle condition.
    pub network_settle_ms: u64,
    /// First debug port; each launched browser takes the next one.
    pub debug_port_base: u16,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        BrowserConfig {
            chrome_path: None,
            force_no_sandbox: false,
            network_settle_ms: 2000,
            debug_port_base: 9222,
        }
    }
}

/// Filter list location and cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    pub url: String,
    pub cache_file: Option<PathBuf>,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        BlocklistConfig {
            url: blocklist::DEFAULT_FILTER_LIST_URL.to_string(),
            cache_file: None,
        }
    }
}

impl BlocklistConfig {
    pub fn cache_path(&self) -> PathBuf {
        self.cache_file
            .clone()
            .unwrap_or_else(blocklist::default_cache_path)
    }
}

impl RuntimeConfig {
    /// Load the config honoring `STACKPROBE_CONFIG`, falling back to the
    /// default path, falling back to defaults when no file exists.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(CONFIG_PATH));
        if !path.exists() {
            return Ok(RuntimeConfig::default());
        }
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.blocklist.url.starts_with("https://") && !self.blocklist.url.starts_with("http://")
        {
            return Err(ConfigError::InvalidUrl {
                field: "blocklist.url".to_string(),
                url: self.blocklist.url.clone(),
            });
        }
        if self.browser.debug_port_base == 0 {
            return Err(ConfigError::ZeroValue {
                field: "browser.debug_port_base".to_string(),
            });
        }
        Ok(())
    }
}
