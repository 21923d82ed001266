//! Service safety limits (normative defaults).
//!
//! Values are intentionally explicit about their units to avoid confusion.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_replication_batch_events: usize,
    pub max_replication_batch_bytes: usize,
    pub max_raw_blob_bytes: usize,

    pub execution_cache_max_entries: usize,
    pub lock_acquire_timeout_ms: u64,
    pub lock_retry_interval_ms: u64,

    pub notifier_max_waiters_per_shard: usize,
    pub notifier_channel_depth: usize,
    pub poll_mutable_state_timeout_ms: u64,

    pub dlq_read_max_page_size: usize,
    pub replication_messages_max_batch: usize,

    pub history_read_page_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_replication_batch_events: 4_096,
            max_replication_batch_bytes: 16 * 1024 * 1024,
            max_raw_blob_bytes: 16 * 1024 * 1024,

            execution_cache_max_entries: 8_192,
            lock_acquire_timeout_ms: 10_000,
            lock_retry_interval_ms: 5,

            notifier_max_waiters_per_shard: 1_024,
            notifier_channel_depth: 16,
            poll_mutable_state_timeout_ms: 20_000,

            dlq_read_max_page_size: 1_000,
            replication_messages_max_batch: 100,

            history_read_page_size: 1_000,
        }
    }
}
