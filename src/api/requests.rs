//! Transport-agnostic request/response payloads of the history service.
//!
//! Field sets mirror the replication wire protocol; the RPC layer that
//! carries them is out of scope.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::{
    ClusterName, EventId, HistoryEvent, NamespaceId, ReplicationInfo, RunId, ShardId, TaskId,
    Version, VersionHistoryItem, WorkflowId, WorkflowState,
};
use crate::persistence::ReplicationTaskEntry;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
}

/// V1 replication: per-cluster replication info carries the divergence
/// evidence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicateEventsRequest {
    pub source_cluster: ClusterName,
    pub namespace_id: NamespaceId,
    pub workflow_execution: WorkflowExecution,
    pub first_event_id: EventId,
    pub next_event_id: EventId,
    pub version: Version,
    pub replication_info: BTreeMap<ClusterName, ReplicationInfo>,
    pub history: Vec<HistoryEvent>,
    pub new_run_history: Vec<HistoryEvent>,
    pub reset_workflow: bool,
    /// Deprecated on the wire; still consulted for closed workflows on
    /// ingest, never set on emit.
    pub force_buffer_events: bool,
}

/// V2 replication: explicit version-history items instead of per-cluster
/// replication info. Events travel as encoded blobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicateEventsV2Request {
    pub namespace_id: NamespaceId,
    pub workflow_execution: WorkflowExecution,
    pub version_history_items: Vec<VersionHistoryItem>,
    pub events: Bytes,
    pub new_run_events: Option<Bytes>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobEncoding {
    Cbor,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryBlob {
    pub encoding: BlobEncoding,
    pub data: Bytes,
}

/// V1 semantics on the compressed wire format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicateRawEventsRequest {
    pub namespace_id: NamespaceId,
    pub workflow_execution: WorkflowExecution,
    pub replication_info: BTreeMap<ClusterName, ReplicationInfo>,
    pub history: HistoryBlob,
    pub new_run_history: Option<HistoryBlob>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncActivityRequest {
    pub source_cluster: ClusterName,
    pub namespace_id: NamespaceId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub version: Version,
    pub scheduled_id: EventId,
    pub scheduled_time_ms: u64,
    pub started_id: Option<EventId>,
    pub started_time_ms: Option<u64>,
    pub last_heartbeat_ms: Option<u64>,
    pub details: Option<serde_json::Value>,
    pub attempt: u32,
    pub last_failure: Option<String>,
    pub last_worker_identity: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncShardStatusRequest {
    pub source_cluster: ClusterName,
    pub shard_id: ShardId,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationToken {
    pub shard_id: ShardId,
    pub last_processed_message_id: i64,
    pub last_retrieved_message_id: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetReplicationMessagesRequest {
    pub tokens: Vec<ReplicationToken>,
    pub cluster_name: ClusterName,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMessages {
    pub replication_tasks: Vec<ReplicationTaskEntry>,
    pub last_retrieved_message_id: i64,
    pub has_more: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetReplicationMessagesResponse {
    pub messages_by_shard: BTreeMap<ShardId, ReplicationMessages>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqType {
    Replication,
    Namespace,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetDlqReplicationMessagesRequest {
    pub source_cluster: ClusterName,
    pub shard_id: ShardId,
    pub message_ids: Vec<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadDlqMessagesRequest {
    pub dlq_type: DlqType,
    pub shard_id: ShardId,
    pub source_cluster: ClusterName,
    pub inclusive_end_message_id: Option<i64>,
    pub maximum_page_size: usize,
    pub next_page_token: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadDlqMessagesResponse {
    pub dlq_type: DlqType,
    pub messages: Vec<DlqMessage>,
    pub next_page_token: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PurgeDlqMessagesRequest {
    pub dlq_type: DlqType,
    pub shard_id: ShardId,
    pub source_cluster: ClusterName,
    pub inclusive_end_message_id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeDlqMessagesRequest {
    pub dlq_type: DlqType,
    pub shard_id: ShardId,
    pub source_cluster: ClusterName,
    pub inclusive_end_message_id: Option<i64>,
    pub maximum_page_size: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeDlqMessagesResponse {
    pub merged: usize,
    pub next_page_token: Option<i64>,
}

/// A replication request diverted to the dead-letter queue, with the
/// conflict that sent it there.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DlqMessage {
    pub message_id: i64,
    pub source_cluster: ClusterName,
    pub request: ReplicateEventsRequest,
    pub failure: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReapplyEventsRequest {
    pub namespace_id: NamespaceId,
    pub workflow_execution: WorkflowExecution,
    pub events: Vec<HistoryEvent>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefreshWorkflowTasksRequest {
    pub namespace_id: NamespaceId,
    pub workflow_execution: WorkflowExecution,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollMutableStateRequest {
    pub namespace_id: NamespaceId,
    pub workflow_execution: WorkflowExecution,
    /// Long-poll: return once `next_event_id` exceeds this value.
    pub expected_next_event_id: Option<EventId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollMutableStateResponse {
    pub workflow_execution: WorkflowExecution,
    pub next_event_id: EventId,
    pub last_event_task_id: TaskId,
    /// Duplicates `workflow_state`; both are populated and consumers may
    /// read either.
    pub is_workflow_running: bool,
    pub workflow_state: WorkflowState,
    pub branch_token: Bytes,
    pub last_write_version: Version,
}
