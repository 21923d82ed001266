//! Per-shard persisted control record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::{ClusterName, ShardId};

/// Shard ownership and ack-level bookkeeping. `range_id` fences writers: a
/// shard write with a stale range id means ownership moved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub transfer_ack_level: i64,
    pub timer_ack_level: u64,
    pub replication_ack_level: i64,
    pub cluster_transfer_ack_levels: BTreeMap<ClusterName, i64>,
}

impl ShardInfo {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            range_id: 1,
            transfer_ack_level: 0,
            timer_ack_level: 0,
            replication_ack_level: 0,
            cluster_transfer_ack_levels: BTreeMap::new(),
        }
    }
}
