//! Service configuration: schema + file loading.

pub mod load;
pub mod schema;

pub use load::{CONFIG_ENV_VAR, ConfigError, DEFAULT_CONFIG_FILE, load, load_from_path};
pub use schema::{
    ClusterConfig, ClusterEntryConfig, Config, FileLoggingConfig, HistoryConfig, LogFormat,
    LogRotation, LoggingConfig,
};
