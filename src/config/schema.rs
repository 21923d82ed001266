//! Service configuration schema.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::Limits;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            history: HistoryConfig::default(),
            logging: LoggingConfig::default(),
            limits: Limits::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub current: String,
    pub failover_version_increment: i64,
    pub global_namespaces_enabled: bool,
    pub clusters: BTreeMap<String, ClusterEntryConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let mut clusters = BTreeMap::new();
        clusters.insert(
            "active".to_string(),
            ClusterEntryConfig {
                initial_failover_version: 1,
                enabled: true,
            },
        );
        Self {
            current: "active".to_string(),
            failover_version_increment: 10,
            global_namespaces_enabled: true,
            clusters,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterEntryConfig {
    pub initial_failover_version: i64,
    pub enabled: bool,
}

impl Default for ClusterEntryConfig {
    fn default() -> Self {
        Self {
            initial_failover_version: 0,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub shard_count: u32,
    pub default_retention_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            default_retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
        }
    }
}

impl Config {
    /// Build the cluster metadata registry from this config.
    pub fn cluster_metadata(
        &self,
    ) -> Result<crate::cluster::ClusterMetadata, crate::cluster::ClusterMetadataError> {
        let mut clusters = BTreeMap::new();
        for (name, entry) in &self.cluster.clusters {
            let name = crate::core::ClusterName::new(name.clone()).map_err(|_| {
                crate::cluster::ClusterMetadataError::InvalidClusterName { raw: name.clone() }
            })?;
            clusters.insert(
                name,
                crate::cluster::ClusterInfo {
                    initial_failover_version: entry.initial_failover_version,
                    enabled: entry.enabled,
                },
            );
        }
        let current = crate::core::ClusterName::new(self.cluster.current.clone()).map_err(|_| {
            crate::cluster::ClusterMetadataError::InvalidClusterName {
                raw: self.cluster.current.clone(),
            }
        })?;
        crate::cluster::ClusterMetadata::new(
            current,
            self.cluster.failover_version_increment,
            clusters,
            self.cluster.global_namespaces_enabled,
        )
    }
}
