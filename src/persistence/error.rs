//! Typed store conditions.
//!
//! `AlreadyStarted` and `NotFound` are decision-table inputs for the
//! replicator, not failures; everything else surfaces to the caller.

use thiserror::Error;

use crate::core::{RunId, Version, WorkflowState, WorkflowStatus};
use crate::error::{Effect, Transience};

/// Payload of the workflow-id-reuse condition: who currently holds the
/// workflow id and where their log ends.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowAlreadyStarted {
    pub run_id: RunId,
    pub state: WorkflowState,
    pub status: WorkflowStatus,
    pub last_write_version: Version,
    pub create_request_id: String,
}

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ExecutionStoreError {
    #[error("execution not found")]
    NotFound,

    #[error("workflow already started by run {}", .0.run_id)]
    AlreadyStarted(WorkflowAlreadyStarted),

    #[error("conditional update failed: expected condition {expected}, stored {actual}")]
    ConditionFailed { expected: i64, actual: i64 },

    #[error("shard {shard_id} ownership lost (range {requested} != {actual})")]
    ShardOwnershipLost {
        shard_id: u32,
        requested: i64,
        actual: i64,
    },

    #[error("execution store internal error: {0}")]
    Internal(String),
}

impl ExecutionStoreError {
    pub fn transience(&self) -> Transience {
        match self {
            ExecutionStoreError::NotFound | ExecutionStoreError::AlreadyStarted(_) => {
                Transience::Permanent
            }
            ExecutionStoreError::ConditionFailed { .. }
            | ExecutionStoreError::ShardOwnershipLost { .. } => Transience::Retryable,
            ExecutionStoreError::Internal(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ExecutionStoreError::NotFound
            | ExecutionStoreError::AlreadyStarted(_)
            | ExecutionStoreError::ConditionFailed { .. }
            | ExecutionStoreError::ShardOwnershipLost { .. } => Effect::None,
            ExecutionStoreError::Internal(_) => Effect::Unknown,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum HistoryStoreError {
    #[error("history branch not found")]
    BranchNotFound,

    #[error("history store internal error: {0}")]
    Internal(String),
}

impl HistoryStoreError {
    pub fn transience(&self) -> Transience {
        match self {
            HistoryStoreError::BranchNotFound => Transience::Permanent,
            HistoryStoreError::Internal(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            HistoryStoreError::BranchNotFound => Effect::None,
            HistoryStoreError::Internal(_) => Effect::Unknown,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ShardStoreError {
    #[error("shard {0} not found")]
    NotFound(u32),

    #[error("shard {shard_id} ownership lost (range {requested} != {actual})")]
    OwnershipLost {
        shard_id: u32,
        requested: i64,
        actual: i64,
    },

    #[error("shard store internal error: {0}")]
    Internal(String),
}

impl ShardStoreError {
    pub fn transience(&self) -> Transience {
        match self {
            ShardStoreError::NotFound(_) => Transience::Permanent,
            ShardStoreError::OwnershipLost { .. } => Transience::Retryable,
            ShardStoreError::Internal(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ShardStoreError::NotFound(_) | ShardStoreError::OwnershipLost { .. } => Effect::None,
            ShardStoreError::Internal(_) => Effect::Unknown,
        }
    }
}
