//! Configuration
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `VELES_SERVER__URL`-style environment variables
//! (prefix `VELES_`, `__` between nested keys).

pub mod facade;
pub mod merge;
pub mod paths;
pub mod sources;

pub use crate::logging::LoggingConfig;
pub use facade::ConfigLoader;

use crate::error::VelesError;
use crate::proto::VelesUrl;
use crate::tracker::DEFAULT_HANDLE_CACHE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Listener used when no URL is configured
pub const DEFAULT_URL: &str = "veles://@127.0.0.1:3135";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VelesConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `veles://` or `veles+unix://` URL to listen on
    #[serde(default = "default_url")]
    pub url: String,

    /// Database file; None places it in the platform data directory
    #[serde(default)]
    pub database: Option<PathBuf>,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_max_frame_size() -> usize {
    crate::proto::DEFAULT_MAX_FRAME_SIZE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            database: None,
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ServerConfig {
    pub fn parsed_url(&self) -> Result<VelesUrl, VelesError> {
        VelesUrl::parse(&self.url)
    }

    /// Configured database path, or the default one.
    pub fn database_path(&self) -> Result<PathBuf, VelesError> {
        match &self.database {
            Some(path) => Ok(path.clone()),
            None => paths::xdg_root::default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Node handles kept in the tracker's LRU cache
    #[serde(default = "default_handle_cache_size")]
    pub handle_cache_size: usize,
}

fn default_handle_cache_size() -> usize {
    DEFAULT_HANDLE_CACHE_SIZE
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            handle_cache_size: default_handle_cache_size(),
        }
    }
}

impl VelesConfig {
    pub fn validate(&self) -> Result<(), VelesError> {
        self.server.parsed_url()?;
        if self.server.max_frame_size == 0 {
            return Err(VelesError::ConfigError("server.max_frame_size must be positive".to_string()));
        }
        if self.tracker.handle_cache_size == 0 {
            return Err(VelesError::ConfigError(
                "tracker.handle_cache_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VelesConfig::default();
        assert_eq!(config.server.url, DEFAULT_URL);
        assert_eq!(config.tracker.handle_cache_size, 1024);
        assert_eq!(config.server.max_frame_size, 64 * 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_cache_rejected() {
        let mut config = VelesConfig::default();
        config.tracker.handle_cache_size = 0;
        assert_eq!(config.validate().unwrap_err().code(), "config_error");
    }

    #[test]
    fn test_database_override() {
        let mut config = ServerConfig::default();
        config.database = Some(PathBuf::from("/tmp/x.db"));
        assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/x.db"));
    }
}
