//! MergeService: orchestrates sources and deserializes to VelesConfig.

use super::builder_with_defaults;
use crate::config::sources::{environment, user_file};
use crate::config::VelesConfig;
use config::{ConfigError, File, FileFormat};
use std::path::Path;

/// Merge service for config composition.
pub struct MergeService;

impl MergeService {
    /// Precedence: defaults (lowest) -> user config file -> environment (highest).
    pub fn load() -> Result<VelesConfig, ConfigError> {
        let builder = builder_with_defaults()?;
        let builder = user_file::add_to_builder(builder)?;
        let builder = environment::add_to_builder(builder)?;
        builder.build()?.try_deserialize()
    }

    /// Load an explicit file with the environment overlay; the file must exist.
    pub fn load_from_file(path: &Path) -> Result<VelesConfig, ConfigError> {
        let name = path
            .to_str()
            .ok_or_else(|| ConfigError::Message(format!("config path is not UTF-8: {}", path.display())))?;
        let builder = builder_with_defaults()?.add_source(File::new(name, FileFormat::Toml));
        let builder = environment::add_to_builder(builder)?;
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[server]\nurl = \"veles+unix://00@/tmp/veles.sock\"\n\n[tracker]\nhandle_cache_size = 16"
        )
        .unwrap();
        let config = MergeService::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.url, "veles+unix://00@/tmp/veles.sock");
        assert_eq!(config.tracker.handle_cache_size, 16);
        assert_eq!(config.server.max_frame_size, crate::proto::DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MergeService::load_from_file(&dir.path().join("absent.toml")).is_err());
    }
}
