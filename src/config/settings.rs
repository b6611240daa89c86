use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the listeners, the persistent file and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the server.
///
/// NT4 clients connect over WebSockets on `nt4_port`, NT3 clients over TCP
/// on `nt3_port`. `tick_ms` is the interval of the periodic send driver.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub nt4_port: u16,
    pub nt3_port: u16,
    pub tick_ms: u64,
}

/// Where persistent topics are kept and how often they are saved.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub persistent_file: String,
    pub save_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub nt4_port: Option<u16>,
    pub nt3_port: Option<u16>,
    pub tick_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStorageSettings {
    pub persistent_file: Option<String>,
    pub save_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                nt4_port: 5810,
                nt3_port: 1735,
                tick_ms: 5,
            },
            storage: StorageSettings {
                persistent_file: "networktables.json".to_string(),
                save_interval_ms: 1000,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl ServerSettings {
    pub fn nt4_addr(&self) -> String {
        format!("{}:{}", self.host, self.nt4_port)
    }

    pub fn nt3_addr(&self) -> String {
        format!("{}:{}", self.host, self.nt3_port)
    }
}
