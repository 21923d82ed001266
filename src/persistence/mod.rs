//! Persistence capability contracts.
//!
//! The engine behind these traits is out of scope; the replicator only
//! depends on the operations and typed conditions below. `MemoryStore`
//! implements the whole surface for the service tests.

pub mod error;
pub mod memory;
pub mod tasks;

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::{
    ActivityInfo, EventId, ExecutionInfo, HistoryEvent, NamespaceId, ReplicationState, RunId,
    ShardId, ShardInfo, Version, VersionHistories, WorkflowId, WorkflowKey, WorkflowState,
    WorkflowStatus,
};

pub use error::{
    ExecutionStoreError, HistoryStoreError, ShardStoreError, WorkflowAlreadyStarted,
};
pub use memory::MemoryStore;
pub use tasks::{
    ReplicationTask, ReplicationTaskEntry, TaskCategory, TaskType, TimerTask, TransferTask,
};

/// The current-run pointer of a workflow id: the latest run, which may
/// already be closed.
#[derive(Clone, Debug, PartialEq)]
pub struct CurrentExecution {
    pub run_id: RunId,
    pub state: WorkflowState,
    pub status: WorkflowStatus,
    pub last_write_version: Version,
}

/// Full row image of one run, produced by `close_transaction_as_snapshot`
/// and consumed whole by create/update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub execution_info: ExecutionInfo,
    pub replication_state: ReplicationState,
    pub version_histories: Option<VersionHistories>,
    pub activities: BTreeMap<EventId, ActivityInfo>,
    pub buffered_events: Vec<HistoryEvent>,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
    pub replication_tasks: Vec<ReplicationTask>,
}

/// A run row as read back: the snapshot plus the condition token guarding
/// the next conditional update.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredExecution {
    pub snapshot: WorkflowSnapshot,
    pub update_condition: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// No run may exist for the workflow id.
    BrandNew,
    /// Replace a closed current run, fenced by its run id and last write
    /// version.
    WorkflowIdReuse,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreateWorkflowExecutionRequest {
    pub namespace_id: NamespaceId,
    pub workflow_id: WorkflowId,
    pub mode: CreateMode,
    pub previous_run_id: Option<RunId>,
    pub previous_last_write_version: Option<Version>,
    pub snapshot: WorkflowSnapshot,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateWorkflowExecutionRequest {
    pub namespace_id: NamespaceId,
    pub workflow_id: WorkflowId,
    pub snapshot: WorkflowSnapshot,
    pub update_condition: i64,
}

pub trait ExecutionStore: Send + Sync {
    fn get_current_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
    ) -> Result<CurrentExecution, ExecutionStoreError>;

    fn get_workflow_execution(
        &self,
        key: &WorkflowKey,
    ) -> Result<StoredExecution, ExecutionStoreError>;

    fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), ExecutionStoreError>;

    fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), ExecutionStoreError>;

    fn delete_workflow_execution(&self, key: &WorkflowKey) -> Result<(), ExecutionStoreError>;
}

/// One page of a branch read; `next` is the resume cursor.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryBranchPage {
    pub events: Vec<HistoryEvent>,
    pub next: Option<EventId>,
}

pub trait HistoryStore: Send + Sync {
    fn append_history_nodes(
        &self,
        branch_token: &Bytes,
        events: &[HistoryEvent],
        shard_id: ShardId,
    ) -> Result<(), HistoryStoreError>;

    /// Read `[min_event_id, max_event_id)` from a branch, at most
    /// `page_size` events, resuming from `token` when set.
    fn read_history_branch(
        &self,
        branch_token: &Bytes,
        min_event_id: EventId,
        max_event_id: EventId,
        page_size: usize,
        token: Option<EventId>,
    ) -> Result<HistoryBranchPage, HistoryStoreError>;

    fn delete_history_branch(
        &self,
        branch_token: &Bytes,
        shard_id: ShardId,
    ) -> Result<(), HistoryStoreError>;
}

pub trait ShardStore: Send + Sync {
    fn get_shard(&self, shard_id: ShardId) -> Result<ShardInfo, ShardStoreError>;

    /// Conditional on `previous_range_id`; a mismatch is ownership loss.
    fn update_shard(
        &self,
        info: ShardInfo,
        previous_range_id: i64,
    ) -> Result<(), ShardStoreError>;
}

/// Read side of a shard's replication task queue, consumed by
/// `GetReplicationMessages`.
pub trait ReplicationQueue: Send + Sync {
    /// Tasks with id strictly greater than `last_retrieved`, oldest first,
    /// at most `batch_size`.
    fn read_replication_tasks(
        &self,
        shard_id: ShardId,
        last_retrieved: i64,
        batch_size: usize,
    ) -> Result<Vec<ReplicationTaskEntry>, ExecutionStoreError>;
}
