use thiserror::Error;

use crate::core::CoreError;
use crate::history::ReplicationError;
use crate::persistence::{ExecutionStoreError, HistoryStoreError, ShardStoreError};

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    ExecutionStore(#[from] ExecutionStoreError),

    #[error(transparent)]
    HistoryStore(#[from] HistoryStoreError),

    #[error(transparent)]
    ShardStore(#[from] ShardStoreError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(err) => err.transience(),
            Error::Replication(err) => err.transience(),
            Error::ExecutionStore(err) => err.transience(),
            Error::HistoryStore(err) => err.transience(),
            Error::ShardStore(err) => err.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(err) => err.effect(),
            Error::Replication(err) => err.effect(),
            Error::ExecutionStore(err) => err.effect(),
            Error::HistoryStore(err) => err.effect(),
            Error::ShardStore(err) => err.effect(),
        }
    }
}
