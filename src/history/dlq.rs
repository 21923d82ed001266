//! Replication dead-letter queue.
//!
//! Conflict-class failures divert the originating request here instead of
//! blocking the replication stream. Durable storage is someone else's
//! problem; this is the ingress/egress contract plus the in-memory
//! implementation the service tests run on.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::api::requests::DlqMessage;
use crate::core::{ClusterName, ShardId};
use crate::persistence::ExecutionStoreError;

pub trait DlqStore: Send + Sync {
    /// Append a diverted request; returns the assigned message id.
    fn enqueue(
        &self,
        shard_id: ShardId,
        source_cluster: &ClusterName,
        message: DlqMessage,
    ) -> Result<i64, ExecutionStoreError>;

    /// Read messages with id `> token` and `<= inclusive_end` (when set),
    /// oldest first. Returns the page and the resume token.
    fn read(
        &self,
        shard_id: ShardId,
        source_cluster: &ClusterName,
        inclusive_end: Option<i64>,
        page_size: usize,
        token: Option<i64>,
    ) -> Result<(Vec<DlqMessage>, Option<i64>), ExecutionStoreError>;

    /// Drop all messages with id `<= inclusive_end` (all when unset).
    fn purge(
        &self,
        shard_id: ShardId,
        source_cluster: &ClusterName,
        inclusive_end: Option<i64>,
    ) -> Result<usize, ExecutionStoreError>;

    /// Remove one message after a successful merge.
    fn remove(
        &self,
        shard_id: ShardId,
        source_cluster: &ClusterName,
        message_id: i64,
    ) -> Result<(), ExecutionStoreError>;
}

#[derive(Default)]
struct MemoryDlqInner {
    queues: BTreeMap<(ShardId, ClusterName), BTreeMap<i64, DlqMessage>>,
    next_message_id: i64,
}

#[derive(Default)]
pub struct MemoryDlq {
    inner: Mutex<MemoryDlqInner>,
}

impl MemoryDlq {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryDlqInner> {
        self.inner.lock().expect("dlq lock poisoned")
    }
}

impl DlqStore for MemoryDlq {
    fn enqueue(
        &self,
        shard_id: ShardId,
        source_cluster: &ClusterName,
        mut message: DlqMessage,
    ) -> Result<i64, ExecutionStoreError> {
        let mut inner = self.lock();
        inner.next_message_id += 1;
        let message_id = inner.next_message_id;
        message.message_id = message_id;
        inner
            .queues
            .entry((shard_id, source_cluster.clone()))
            .or_default()
            .insert(message_id, message);
        Ok(message_id)
    }

    fn read(
        &self,
        shard_id: ShardId,
        source_cluster: &ClusterName,
        inclusive_end: Option<i64>,
        page_size: usize,
        token: Option<i64>,
    ) -> Result<(Vec<DlqMessage>, Option<i64>), ExecutionStoreError> {
        let inner = self.lock();
        let Some(queue) = inner.queues.get(&(shard_id, source_cluster.clone())) else {
            return Ok((Vec::new(), None));
        };
        let start = token.map(|id| id + 1).unwrap_or(i64::MIN);
        let end = inclusive_end.unwrap_or(i64::MAX);
        let page: Vec<DlqMessage> = queue
            .range(start..=end)
            .take(page_size)
            .map(|(_, message)| message.clone())
            .collect();
        let next = match page.last() {
            Some(last) if queue.range(last.message_id + 1..=end).next().is_some() => {
                Some(last.message_id)
            }
            _ => None,
        };
        Ok((page, next))
    }

    fn purge(
        &self,
        shard_id: ShardId,
        source_cluster: &ClusterName,
        inclusive_end: Option<i64>,
    ) -> Result<usize, ExecutionStoreError> {
        let mut inner = self.lock();
        let Some(queue) = inner.queues.get_mut(&(shard_id, source_cluster.clone())) else {
            return Ok(0);
        };
        let end = inclusive_end.unwrap_or(i64::MAX);
        let doomed: Vec<i64> = queue.range(..=end).map(|(id, _)| *id).collect();
        for id in &doomed {
            queue.remove(id);
        }
        Ok(doomed.len())
    }

    fn remove(
        &self,
        shard_id: ShardId,
        source_cluster: &ClusterName,
        message_id: i64,
    ) -> Result<(), ExecutionStoreError> {
        let mut inner = self.lock();
        let Some(queue) = inner.queues.get_mut(&(shard_id, source_cluster.clone())) else {
            return Err(ExecutionStoreError::NotFound);
        };
        queue
            .remove(&message_id)
            .map(|_| ())
            .ok_or(ExecutionStoreError::NotFound)
    }
}
