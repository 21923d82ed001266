//! Config file loading.
//!
//! TOML on disk, `STRAND_CONFIG` to point somewhere else, defaults when no
//! file exists.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::schema::Config;

pub const CONFIG_ENV_VAR: &str = "STRAND_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "strand.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve the config file (`STRAND_CONFIG`, then `strand.toml` in the
/// working directory) and load it; a missing file yields defaults.
pub fn load() -> Result<Config, ConfigError> {
    let path = std::env::var_os(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if !path.exists() {
        return Ok(Config::default());
    }
    load_from_path(&path)
}
