#![forbid(unsafe_code)]

pub mod api;
pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod history;
pub mod namespace;
pub mod persistence;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    ActivityInfo, CancellationToken, ClusterName, CoreError, DecisionFailCause, DecisionInfo,
    EventAttributes, EventId, EventType, ExecutionInfo, HistoryBatch, HistoryEvent, Limits,
    NamespaceId, ReplicationInfo, ReplicationState, RunId, ShardId, ShardInfo,
    SignaledAttributes, StartedAttributes, TaskId, TerminatedAttributes, Version,
    VersionHistories, VersionHistory, VersionHistoryItem, WallClock, WorkflowId, WorkflowKey,
    WorkflowState, WorkflowStatus,
};
pub use crate::history::{
    HistoryEventNotifier, HistoryReplicator, HistoryService, MutableState, ReplicationError,
    TransactionPolicy,
};
