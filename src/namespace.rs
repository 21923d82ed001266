//! Namespace registry: read-mostly cache of namespace metadata.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ClusterName, NamespaceId, Version};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub id: NamespaceId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub retention_days: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceReplicationConfig {
    pub active_cluster: ClusterName,
    pub clusters: Vec<ClusterName>,
}

/// Snapshot-consistent namespace entry. Readers hold the `Arc`; updates
/// replace whole entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub info: NamespaceInfo,
    pub config: NamespaceConfig,
    pub replication_config: NamespaceReplicationConfig,
    pub failover_version: Version,
    pub is_global: bool,
}

impl NamespaceEntry {
    pub fn active_cluster(&self) -> &ClusterName {
        &self.replication_config.active_cluster
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NamespaceCacheError {
    #[error("namespace {0} not registered")]
    NotFound(NamespaceId),
}

#[derive(Default)]
pub struct NamespaceCache {
    entries: RwLock<BTreeMap<NamespaceId, Arc<NamespaceEntry>>>,
}

impl NamespaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_namespace_by_id(
        &self,
        id: &NamespaceId,
    ) -> Result<Arc<NamespaceEntry>, NamespaceCacheError> {
        self.entries
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| NamespaceCacheError::NotFound(id.clone()))
    }

    /// Insert or replace an entry. Background refresh uses this; readers
    /// keep observing the snapshot they already hold.
    pub fn register(&self, entry: NamespaceEntry) {
        self.entries
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(entry.info.id.clone(), Arc::new(entry));
    }
}
