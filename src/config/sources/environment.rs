//! Environment variable source: `VELES_` prefix, `__` between nested keys

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::Environment;

fn environment() -> Environment {
    Environment::with_prefix("VELES")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Add environment variable overlay to builder.
/// `VELES_SERVER__URL` sets `server.url`.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Ok(builder.add_source(environment()))
}
