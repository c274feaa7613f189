//! Optional per-user config file at `$XDG_CONFIG_HOME/veles/config.toml`.

use crate::config::paths::xdg_root;
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File, FileFormat};

pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let Ok(path) = xdg_root::default_config_path() else {
        return Ok(builder);
    };
    match path.to_str() {
        Some(name) => Ok(builder.add_source(File::new(name, FileFormat::Toml).required(false))),
        None => Ok(builder),
    }
}
