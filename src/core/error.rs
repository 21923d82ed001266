//! Core capability errors (parsing, validation, state-machine invariants).
//!
//! These are bounded and stable: core errors represent domain/refusal
//! states, not library implementation details.

use thiserror::Error;

use crate::error::{Effect, Transience};

use super::event::EventId;
use super::event::Version;
use super::execution::WorkflowState;

/// Invalid identifier.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("namespace id `{raw}` is invalid: {reason}")]
    Namespace { raw: String, reason: String },
    #[error("workflow id `{raw}` is invalid: {reason}")]
    Workflow { raw: String, reason: String },
    #[error("run id `{raw}` is invalid: {reason}")]
    Run { raw: String, reason: String },
    #[error("cluster name `{raw}` is invalid: {reason}")]
    Cluster { raw: String, reason: String },
}

/// Event batch shape violation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventBatchError {
    #[error("event batch is empty")]
    Empty,
    #[error("event batch is non-contiguous: expected {expected}, got {got}")]
    NonContiguous { expected: EventId, got: EventId },
}

/// Version-history invariant violation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionHistoryError {
    #[error("event id {got} does not advance branch past {last}")]
    EventIdNotIncreasing { last: EventId, got: EventId },
    #[error("version {got} regresses below branch version {last}")]
    VersionDecreasing { last: Version, got: Version },
    #[error("version history is empty")]
    Empty,
    #[error("no common ancestor between branches")]
    NoCommonAncestor,
    #[error("branch index {index} out of range ({count} branches)")]
    BranchOutOfRange { index: usize, count: usize },
}

/// Illegal workflow state transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal workflow state transition {from:?} -> {to:?}")]
pub struct StateTransitionError {
    pub from: WorkflowState,
    pub to: WorkflowState,
}

/// Canonical error enum for the core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    EventBatch(#[from] EventBatchError),
    #[error(transparent)]
    VersionHistory(#[from] VersionHistoryError),
    #[error(transparent)]
    StateTransition(#[from] StateTransitionError),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Core errors are pure domain/input failures.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
