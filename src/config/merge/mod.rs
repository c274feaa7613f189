//! Source composition for [`VelesConfig`](super::VelesConfig).

pub mod service;

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError};

/// Builder seeded with built-in defaults, the lowest-precedence layer.
pub(crate) fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let defaults = super::VelesConfig::default();
    config::Config::builder()
        .set_default("server.url", defaults.server.url)?
        .set_default("server.max_frame_size", defaults.server.max_frame_size as u64)?
        .set_default("tracker.handle_cache_size", defaults.tracker.handle_cache_size as u64)?
        .set_default("logging.level", defaults.logging.level)?
        .set_default("logging.format", defaults.logging.format)?
        .set_default("logging.output", defaults.logging.output)
}
