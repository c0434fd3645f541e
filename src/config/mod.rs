mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{SchedulerSettings, ServerSettings, Settings, StorageSettings};


/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the server, storage and scheduler
/// configurations
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("_"));

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
            port: partial
                .server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        storage: StorageSettings {
            data_dir: partial
                .storage
                .as_ref()
                .and_then(|s| s.data_dir.clone())
                .unwrap_or(default.storage.data_dir),
        },
        scheduler: SchedulerSettings {
            promote_interval_secs: partial
                .scheduler
                .as_ref()
                .and_then(|s| s.promote_interval_secs)
                .unwrap_or(default.scheduler.promote_interval_secs),
            retention_interval_secs: partial
                .scheduler
                .as_ref()
                .and_then(|s| s.retention_interval_secs)
                .unwrap_or(default.scheduler.retention_interval_secs),
            retention_hours: partial
                .scheduler
                .as_ref()
                .and_then(|s| s.retention_hours)
                .unwrap_or(default.scheduler.retention_hours),
        },
    })
}
