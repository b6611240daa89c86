mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{LoggingSettings, ServerSettings, Settings, StorageSettings};

/// Environment variables look like `NTSERVE_SERVER__NT4_PORT`.
pub const ENV_PREFIX: &str = "NTSERVE";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the server, storage and logging configurations
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as `load_config`, reading the optional file at `path` (extension
/// may be omitted).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    Ok(Settings {
        server: ServerSettings {
            host: partial
                .server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            nt4_port: partial
                .server
                .as_ref()
                .and_then(|s| s.nt4_port)
                .unwrap_or(default.server.nt4_port),
            nt3_port: partial
                .server
                .as_ref()
                .and_then(|s| s.nt3_port)
                .unwrap_or(default.server.nt3_port),
            tick_ms: partial
                .server
                .as_ref()
                .and_then(|s| s.tick_ms)
                .unwrap_or(default.server.tick_ms),
        },
        storage: StorageSettings {
            persistent_file: partial
                .storage
                .as_ref()
                .and_then(|s| s.persistent_file.clone())
                .unwrap_or(default.storage.persistent_file),
            save_interval_ms: partial
                .storage
                .as_ref()
                .and_then(|s| s.save_interval_ms)
                .unwrap_or(default.storage.save_interval_ms),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
    })
}

#[cfg(test)]
mod tests;
