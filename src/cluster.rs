//! Cluster metadata registry and failover-version algebra.
//!
//! Each cluster owns a residue class of failover versions modulo
//! `failover_version_increment`; the mapping from version to authoring
//! cluster is total for registered clusters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ClusterName, Version};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub initial_failover_version: i64,
    pub enabled: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterMetadataError {
    #[error("no cluster registered for failover version {version}")]
    UnknownVersion { version: Version },
    #[error("cluster `{name}` is not registered")]
    UnknownCluster { name: ClusterName },
    #[error("cluster name `{raw}` is invalid")]
    InvalidClusterName { raw: String },
    #[error(
        "initial failover version {initial} of `{name}` not below increment {increment}"
    )]
    InitialVersionOutOfRange {
        name: ClusterName,
        initial: i64,
        increment: i64,
    },
}

/// Process-wide cluster topology. Built once at startup from config and
/// injected through the resource bundle; read-only afterwards.
#[derive(Clone, Debug)]
pub struct ClusterMetadata {
    current: ClusterName,
    failover_version_increment: i64,
    clusters: BTreeMap<ClusterName, ClusterInfo>,
    global_namespaces_enabled: bool,
}

impl ClusterMetadata {
    pub fn new(
        current: ClusterName,
        failover_version_increment: i64,
        clusters: BTreeMap<ClusterName, ClusterInfo>,
        global_namespaces_enabled: bool,
    ) -> Result<Self, ClusterMetadataError> {
        for (name, info) in &clusters {
            if info.initial_failover_version >= failover_version_increment
                || info.initial_failover_version < 0
            {
                return Err(ClusterMetadataError::InitialVersionOutOfRange {
                    name: name.clone(),
                    initial: info.initial_failover_version,
                    increment: failover_version_increment,
                });
            }
        }
        if !clusters.contains_key(&current) {
            return Err(ClusterMetadataError::UnknownCluster { name: current });
        }
        Ok(Self {
            current,
            failover_version_increment,
            clusters,
            global_namespaces_enabled,
        })
    }

    pub fn current_cluster_name(&self) -> &ClusterName {
        &self.current
    }

    pub fn is_global_namespace_enabled(&self) -> bool {
        self.global_namespaces_enabled
    }

    pub fn all_cluster_info(&self) -> &BTreeMap<ClusterName, ClusterInfo> {
        &self.clusters
    }

    /// Which cluster authored an event stamped with `version`.
    pub fn cluster_name_for_failover_version(
        &self,
        version: Version,
    ) -> Result<&ClusterName, ClusterMetadataError> {
        let residue = version.get().rem_euclid(self.failover_version_increment);
        self.clusters
            .iter()
            .find(|(_, info)| info.initial_failover_version == residue)
            .map(|(name, _)| name)
            .ok_or(ClusterMetadataError::UnknownVersion { version })
    }

    /// Two versions belong to the same cluster when they share a residue
    /// class modulo the increment.
    pub fn is_version_from_same_cluster(&self, a: Version, b: Version) -> bool {
        (a.get() - b.get()).rem_euclid(self.failover_version_increment) == 0
    }

    /// The next failover version `cluster` would stamp, strictly above
    /// `current_version`.
    pub fn next_failover_version(
        &self,
        cluster: &ClusterName,
        current_version: Version,
    ) -> Result<Version, ClusterMetadataError> {
        let info = self
            .clusters
            .get(cluster)
            .ok_or_else(|| ClusterMetadataError::UnknownCluster {
                name: cluster.clone(),
            })?;
        let increment = self.failover_version_increment;
        let floor =
            current_version.get() / increment * increment + info.initial_failover_version;
        let next = if floor > current_version.get() {
            floor
        } else {
            floor + increment
        };
        Ok(Version::new(next))
    }
}
