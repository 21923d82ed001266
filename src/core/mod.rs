//! Core domain types for strand.
//!
//! Module hierarchy follows type dependency order:
//! - time: wall clock
//! - ids: NamespaceId, WorkflowId, RunId, ClusterName, ShardId
//! - event: EventId, Version, TaskId, HistoryEvent, HistoryBatch
//! - version_history: per-branch (event_id, version) lineage
//! - replication: ReplicationState / ReplicationInfo
//! - execution: WorkflowState, ExecutionInfo, DecisionInfo
//! - shard: ShardInfo
//! - cancel: CancellationToken
//! - limits: normative safety limits

pub mod cancel;
pub mod error;
pub mod event;
pub mod execution;
pub mod ids;
pub mod limits;
pub mod replication;
pub mod shard;
pub mod time;
pub mod version_history;

pub use cancel::CancellationToken;
pub use error::{
    CoreError, EventBatchError, InvalidId, StateTransitionError, VersionHistoryError,
};
pub use event::{
    ContinuedAsNewAttributes, DecisionFailCause, DecisionFailedAttributes,
    DecisionScheduledAttributes, EventAttributes, EventId, EventType, HistoryBatch, HistoryEvent,
    SignaledAttributes, StartedAttributes, TaskId, TerminatedAttributes, Version,
};
pub use execution::{
    ActivityInfo, DecisionInfo, ExecutionInfo, ParentExecution, WorkflowState, WorkflowStatus,
};
pub use ids::{ClusterName, NamespaceId, RunId, ShardId, WorkflowId, WorkflowKey};
pub use limits::Limits;
pub use replication::{ReplicationInfo, ReplicationState};
pub use shard::ShardInfo;
pub use time::{WallClock, WallClockSource, set_wall_clock_source};
pub use version_history::{VersionHistories, VersionHistory, VersionHistoryItem};
