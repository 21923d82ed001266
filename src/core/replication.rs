//! Per-run replication bookkeeping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::event::{EventId, Version};
use super::ids::ClusterName;

/// The highest `(version, event_id)` a run has observed from one peer
/// cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    pub version: Version,
    pub last_event_id: EventId,
}

impl ReplicationInfo {
    pub fn new(version: Version, last_event_id: EventId) -> Self {
        Self {
            version,
            last_event_id,
        }
    }
}

/// Versioned replication state of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationState {
    pub start_version: Version,
    pub current_version: Version,
    pub last_write_version: Version,
    pub last_write_event_id: EventId,
    pub last_replication_info: BTreeMap<ClusterName, ReplicationInfo>,
}

impl ReplicationState {
    pub fn new(start_version: Version) -> Self {
        Self {
            start_version,
            current_version: start_version,
            last_write_version: start_version,
            last_write_event_id: EventId::new(0),
            last_replication_info: BTreeMap::new(),
        }
    }

    /// Record a write at `(version, event_id)` authored by `source_cluster`.
    /// The per-cluster entry remembers the previous high-water mark so that
    /// divergence detection can reason about what each peer has confirmed.
    pub fn record_write(
        &mut self,
        source_cluster: Option<&ClusterName>,
        version: Version,
        event_id: EventId,
    ) {
        if let Some(cluster) = source_cluster {
            self.last_replication_info
                .insert(cluster.clone(), ReplicationInfo::new(version, event_id));
        }
        self.current_version = version;
        self.last_write_version = version;
        self.last_write_event_id = event_id;
    }

    pub fn info_for(&self, cluster: &ClusterName) -> Option<ReplicationInfo> {
        self.last_replication_info.get(cluster).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_write_updates_watermarks() {
        let cluster = ClusterName::new("east").unwrap();
        let mut state = ReplicationState::new(Version::new(1));
        state.record_write(Some(&cluster), Version::new(5), EventId::new(12));

        assert_eq!(state.last_write_version, Version::new(5));
        assert_eq!(state.last_write_event_id, EventId::new(12));
        assert_eq!(
            state.info_for(&cluster),
            Some(ReplicationInfo::new(Version::new(5), EventId::new(12)))
        );
        assert_eq!(state.start_version, Version::new(1));
    }

    #[test]
    fn local_writes_carry_no_cluster_entry() {
        let mut state = ReplicationState::new(Version::new(1));
        state.record_write(None, Version::new(2), EventId::new(3));
        assert!(state.last_replication_info.is_empty());
        assert_eq!(state.current_version, Version::new(2));
    }
}
