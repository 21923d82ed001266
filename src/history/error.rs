//! Replication error taxonomy.
//!
//! Retriable errors carry the exact event-id hint the peer should resume
//! from. Conflict errors are protocol violations: the caller routes the
//! originating task to the replication DLQ instead of retrying.

use thiserror::Error;

use crate::cluster::ClusterMetadataError;
use crate::core::{CoreError, EventId, NamespaceId, RunId, Version, WorkflowId};
use crate::error::{Effect, Transience};
use crate::namespace::NamespaceCacheError;
use crate::persistence::{ExecutionStoreError, HistoryStoreError, ShardStoreError};

pub const ERR_WORKFLOW_NOT_FOUND: &str = "workflow not found on receiving cluster";
pub const ERR_RETRY_EXISTING_WORKFLOW: &str = "workflow with same version is already running";
pub const ERR_RETRY_BUFFER_EVENTS: &str = "event gap detected, resend from hint";

/// Terminate reason stamped on runs the replicator kills during failover
/// reconciliation. Protocol-visible; do not reword.
pub const WORKFLOW_TERMINATION_REASON: &str = "history replicator terminating workflow";
pub const WORKFLOW_TERMINATION_IDENTITY: &str = "history-service";

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{message}: resend {workflow_id}/{run_id:?} from {next_event_id:?}")]
pub struct RetryTaskError {
    pub message: &'static str,
    pub namespace_id: NamespaceId,
    pub workflow_id: WorkflowId,
    pub run_id: Option<RunId>,
    pub next_event_id: Option<EventId>,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReplicationError {
    #[error(transparent)]
    RetryTask(Box<RetryTaskError>),

    #[error("more than two active clusters observed for one workflow")]
    MoreThanTwoActiveClusters,

    #[error(
        "peer claims it observed version {claimed} from us, but our last write is {last_write}"
    )]
    ImpossibleRemoteClaim {
        claimed: Version,
        last_write: Version,
    },

    #[error(
        "replication info claims event {claimed_event_id} beyond our last write {last_write_event_id}"
    )]
    CorruptedReplicationInfo {
        claimed_event_id: EventId,
        last_write_event_id: EventId,
    },

    #[error("neither side's replication info provides a reset checkpoint")]
    MissingReplicationCheckpoint,

    #[error("operation cancelled by caller")]
    Cancelled,

    #[error("timed out locking workflow execution")]
    LockTimeout,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Namespace(#[from] NamespaceCacheError),

    #[error(transparent)]
    Cluster(#[from] ClusterMetadataError),

    #[error(transparent)]
    ExecutionStore(#[from] ExecutionStoreError),

    #[error(transparent)]
    HistoryStore(#[from] HistoryStoreError),

    #[error(transparent)]
    ShardStore(#[from] ShardStoreError),

    #[error("history blob decode: {0}")]
    BlobDecode(#[from] crate::api::BlobDecodeError),
}

impl ReplicationError {
    pub fn retry_task(
        message: &'static str,
        namespace_id: NamespaceId,
        workflow_id: WorkflowId,
        run_id: Option<RunId>,
        next_event_id: Option<EventId>,
    ) -> Self {
        ReplicationError::RetryTask(Box::new(RetryTaskError {
            message,
            namespace_id,
            workflow_id,
            run_id,
            next_event_id,
        }))
    }

    /// Caller should re-send, starting at the hint.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::RetryTask(_) | ReplicationError::LockTimeout => true,
            ReplicationError::ExecutionStore(err) => err.transience().is_retryable(),
            ReplicationError::ShardStore(err) => err.transience().is_retryable(),
            _ => false,
        }
    }

    /// Protocol violation; route the task to the DLQ.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ReplicationError::MoreThanTwoActiveClusters
                | ReplicationError::ImpossibleRemoteClaim { .. }
                | ReplicationError::CorruptedReplicationInfo { .. }
                | ReplicationError::MissingReplicationCheckpoint
        )
    }

    pub fn transience(&self) -> Transience {
        match self {
            ReplicationError::RetryTask(_) | ReplicationError::LockTimeout => {
                Transience::Retryable
            }
            ReplicationError::MoreThanTwoActiveClusters
            | ReplicationError::ImpossibleRemoteClaim { .. }
            | ReplicationError::CorruptedReplicationInfo { .. }
            | ReplicationError::MissingReplicationCheckpoint
            | ReplicationError::Cancelled
            | ReplicationError::BlobDecode(_) => Transience::Permanent,
            ReplicationError::Core(err) => err.transience(),
            ReplicationError::Namespace(_) => Transience::Permanent,
            ReplicationError::Cluster(_) => Transience::Permanent,
            ReplicationError::ExecutionStore(err) => err.transience(),
            ReplicationError::HistoryStore(err) => err.transience(),
            ReplicationError::ShardStore(err) => err.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ReplicationError::RetryTask(_)
            | ReplicationError::LockTimeout
            | ReplicationError::MoreThanTwoActiveClusters
            | ReplicationError::ImpossibleRemoteClaim { .. }
            | ReplicationError::CorruptedReplicationInfo { .. }
            | ReplicationError::MissingReplicationCheckpoint
            | ReplicationError::Cancelled
            | ReplicationError::BlobDecode(_) => Effect::None,
            ReplicationError::Core(err) => err.effect(),
            ReplicationError::Namespace(_) | ReplicationError::Cluster(_) => Effect::None,
            ReplicationError::ExecutionStore(err) => err.effect(),
            ReplicationError::HistoryStore(err) => err.effect(),
            ReplicationError::ShardStore(err) => err.effect(),
        }
    }
}
