use courier_core::{ConfigError, DispatchConfig};

/// `courier` process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path
    pub db_path: String,
    /// Log filter used when `RUST_LOG` is unset or invalid
    pub log_level: String,
    /// Dispatch loop settings
    pub dispatch: DispatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "courier.db".to_string(),
            log_level: "info".to_string(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: lookup("COURIER_DB").unwrap_or_else(|| "courier.db".to_string()),
            log_level: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            dispatch: DispatchConfig::from_lookup(&lookup)?,
        })
    }
}
