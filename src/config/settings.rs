use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the notification server, the storage location and
/// the background scheduler.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub scheduler: SchedulerSettings,
}

/// Configuration settings for the notification server.
///
/// Defines the host and port the WebSocket server will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Configuration settings for the embedded message store.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub data_dir: String,
}

/// Configuration settings for the background scheduler.
///
/// Controls how often due scheduled messages are promoted, how often
/// retention runs, and how long completed/dead-lettered messages are kept.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerSettings {
    pub promote_interval_secs: u64,
    pub retention_interval_secs: u64,
    pub retention_hours: u64,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub scheduler: Option<PartialSchedulerSettings>,
}

/// Partial server settings.
#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Partial storage settings.
#[derive(Debug, Deserialize)]
pub struct PartialStorageSettings {
    pub data_dir: Option<String>,
}

/// Partial scheduler settings.
#[derive(Debug, Deserialize)]
pub struct PartialSchedulerSettings {
    pub promote_interval_secs: Option<u64>,
    pub retention_interval_secs: Option<u64>,
    pub retention_hours: Option<u64>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            storage: StorageSettings {
                data_dir: "pulsemq_db".to_string(),
            },
            scheduler: SchedulerSettings {
                promote_interval_secs: 10,
                retention_interval_secs: 6 * 60 * 60,
                retention_hours: 24,
            },
        }
    }
}
