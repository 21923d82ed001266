//! The workflow-history service suite.
//!
//! Module layering, leaves first: mutable_state carries one run's state;
//! state_builder applies replicated batches to it; cache/context give
//! per-run exclusive access over persistence; conflict_resolver unwinds
//! divergence; replicator holds the reconciliation decision tables; the
//! service facade routes the request surface and the DLQ taxonomy.

pub mod cache;
pub mod conflict_resolver;
pub mod context;
pub mod dlq;
pub mod error;
pub mod metrics;
pub mod mutable_state;
pub mod notifier;
pub mod replicator;
pub mod service;
pub mod state_builder;

pub use cache::{ExecutionCache, ExecutionContext, ExecutionGuard, lock_two};
pub use conflict_resolver::{ConflictResolver, ResetFence};
pub use context::ContextOps;
pub use dlq::{DlqStore, MemoryDlq};
pub use error::{
    ERR_RETRY_BUFFER_EVENTS, ERR_RETRY_EXISTING_WORKFLOW, ERR_WORKFLOW_NOT_FOUND,
    ReplicationError, RetryTaskError, WORKFLOW_TERMINATION_IDENTITY,
    WORKFLOW_TERMINATION_REASON,
};
pub use mutable_state::{MutableState, MutableStateError, TransactionPolicy, WorkflowEvents};
pub use notifier::{EventNotification, HistoryEventNotifier, NotifierError, Subscription};
pub use replicator::{HistoryReplicator, MutableStateView, NoopResetor, WorkflowResetor};
pub use service::HistoryService;
pub use state_builder::{AppliedState, StateBuilder};
