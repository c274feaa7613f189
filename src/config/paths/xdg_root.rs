//! XDG Base Directory locations for config and data.

use crate::error::VelesError;
use std::path::PathBuf;

/// Get XDG data home directory
///
/// Returns `$XDG_DATA_HOME` if set, otherwise defaults to `$HOME/.local/share`
pub fn data_home() -> Option<PathBuf> {
    if let Ok(xdg_data_home) = std::env::var("XDG_DATA_HOME") {
        return Some(PathBuf::from(xdg_data_home));
    }

    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".local").join("share"))
}

/// Get XDG config home directory
///
/// Returns `$XDG_CONFIG_HOME` if set, otherwise defaults to `$HOME/.config`
pub fn config_home() -> Result<PathBuf, VelesError> {
    if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg_config_home));
    }

    let home = std::env::var("HOME").map_err(|_| {
        VelesError::ConfigError(
            "Could not determine XDG config home directory (HOME not set)".to_string(),
        )
    })?;

    Ok(PathBuf::from(home).join(".config"))
}

/// `$XDG_CONFIG_HOME/veles/config.toml`
pub fn default_config_path() -> Result<PathBuf, VelesError> {
    Ok(config_home()?.join("veles").join("config.toml"))
}

/// `$XDG_DATA_HOME/veles/veles.db`
pub fn default_database_path() -> Result<PathBuf, VelesError> {
    let data_home = data_home().ok_or_else(|| {
        VelesError::ConfigError(
            "Could not determine XDG data home directory (HOME not set)".to_string(),
        )
    })?;
    Ok(data_home.join("veles").join("veles.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths_end_in_veles() {
        if let Ok(path) = default_config_path() {
            assert!(path.ends_with("veles/config.toml"));
        }
        if let Ok(path) = default_database_path() {
            assert!(path.ends_with("veles/veles.db"));
        }
    }
}
