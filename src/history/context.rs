//! Load/commit operations over a locked execution context.
//!
//! Exactly one persistence snapshot is committed per request per run: the
//! mutable state closes its transaction, the new events land on the history
//! store, and the row update is conditional on the caller's view. A failed
//! commit clears the cached state so the next load re-reads persistence.

use crate::core::ShardId;
use crate::namespace::NamespaceEntry;
use crate::persistence::{
    ExecutionStore, ExecutionStoreError, HistoryStore, UpdateWorkflowExecutionRequest,
};

use super::cache::ExecutionGuard;
use super::error::ReplicationError;
use super::mutable_state::{MutableState, TransactionPolicy};

pub struct ContextOps<'a> {
    pub execution_store: &'a dyn ExecutionStore,
    pub history_store: &'a dyn HistoryStore,
    pub shard_id: ShardId,
}

impl ContextOps<'_> {
    /// Load the run's mutable state, reading persistence on a cache miss.
    /// `NotFound` surfaces as-is; callers treat it as a decision input.
    pub fn load<'g>(
        &self,
        guard: &'g mut ExecutionGuard<'_>,
        namespace: &NamespaceEntry,
    ) -> Result<&'g mut MutableState, ExecutionStoreError> {
        if guard.cached().is_none() {
            let key = guard.key().clone();
            let stored = self.execution_store.get_workflow_execution(&key)?;
            let state = MutableState::from_stored(
                key.namespace_id,
                key.workflow_id,
                stored,
                namespace.config.retention_days,
            );
            guard.install(state);
        }
        Ok(guard.cached_mut().expect("state loaded above"))
    }

    pub fn update_as_active(
        &self,
        guard: &mut ExecutionGuard<'_>,
        now_ms: u64,
    ) -> Result<(), ReplicationError> {
        self.commit(guard, now_ms, TransactionPolicy::Active)
    }

    pub fn update_as_passive(
        &self,
        guard: &mut ExecutionGuard<'_>,
        now_ms: u64,
    ) -> Result<(), ReplicationError> {
        self.commit(guard, now_ms, TransactionPolicy::Passive)
    }

    fn commit(
        &self,
        guard: &mut ExecutionGuard<'_>,
        now_ms: u64,
        policy: TransactionPolicy,
    ) -> Result<(), ReplicationError> {
        let key = guard.key().clone();
        let state = guard
            .cached_mut()
            .expect("commit requires a loaded mutable state");
        let condition = state.update_condition();
        let (snapshot, events) = state.close_transaction_as_snapshot(now_ms, policy);
        let next_condition = snapshot.execution_info.next_event_id.get();

        for batch in &events {
            if let Err(err) =
                self.history_store
                    .append_history_nodes(&batch.branch_token, &batch.events, self.shard_id)
            {
                guard.clear();
                return Err(err.into());
            }
        }

        let result = self
            .execution_store
            .update_workflow_execution(UpdateWorkflowExecutionRequest {
                namespace_id: key.namespace_id.clone(),
                workflow_id: key.workflow_id.clone(),
                snapshot,
                update_condition: condition,
            });
        match result {
            Ok(()) => {
                let state = guard.cached_mut().expect("state still loaded");
                state.set_update_condition(next_condition);
                Ok(())
            }
            Err(err) => {
                guard.clear();
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        CancellationToken, EventAttributes, EventId, EventType, HistoryEvent, Limits,
        NamespaceId, RunId, TaskId, Version, WorkflowId, WorkflowKey,
    };
    use crate::history::cache::ExecutionCache;
    use crate::namespace::{
        NamespaceConfig, NamespaceInfo, NamespaceReplicationConfig,
    };
    use crate::persistence::{
        CreateMode, CreateWorkflowExecutionRequest, MemoryStore,
    };

    fn namespace_entry() -> NamespaceEntry {
        NamespaceEntry {
            info: NamespaceInfo {
                id: NamespaceId::new("ns1").unwrap(),
                name: "ns1-name".into(),
            },
            config: NamespaceConfig { retention_days: 1 },
            replication_config: NamespaceReplicationConfig {
                active_cluster: crate::core::ClusterName::new("active").unwrap(),
                clusters: vec![crate::core::ClusterName::new("active").unwrap()],
            },
            failover_version: Version::new(1),
            is_global: true,
        }
    }

    fn seeded_store(key: &WorkflowKey) -> MemoryStore {
        let store = MemoryStore::new(ShardId(1));
        let mut state = MutableState::new(
            key.namespace_id.clone(),
            key.workflow_id.clone(),
            key.run_id,
            Version::new(100),
            1,
        );
        state
            .replicate_event(
                &HistoryEvent {
                    event_id: EventId::new(1),
                    version: Version::new(100),
                    task_id: TaskId(1),
                    timestamp_ms: 0,
                    event_type: EventType::WorkflowExecutionStarted,
                    attributes: EventAttributes::Started(Default::default()),
                },
                None,
            )
            .unwrap();
        let (snapshot, events) =
            state.close_transaction_as_snapshot(0, TransactionPolicy::Passive);
        for batch in &events {
            store
                .append_history_nodes(&batch.branch_token, &batch.events, ShardId(1))
                .unwrap();
        }
        store
            .create_workflow_execution(CreateWorkflowExecutionRequest {
                namespace_id: key.namespace_id.clone(),
                workflow_id: key.workflow_id.clone(),
                mode: CreateMode::BrandNew,
                previous_run_id: None,
                previous_last_write_version: None,
                snapshot,
            })
            .unwrap();
        store
    }

    #[test]
    fn load_then_commit_roundtrip() {
        let key = WorkflowKey::new(
            NamespaceId::new("ns1").unwrap(),
            WorkflowId::new("wf1").unwrap(),
            RunId::generate(),
        );
        let store = seeded_store(&key);
        let ops = ContextOps {
            execution_store: &store,
            history_store: &store,
            shard_id: ShardId(1),
        };
        let cache = ExecutionCache::new(Limits::default());
        let context = cache.get_or_create(&key);
        let token = CancellationToken::new();
        let limits = Limits::default();

        let mut guard = context.lock(&token, &limits).unwrap();
        let state = ops.load(&mut guard, &namespace_entry()).unwrap();
        assert_eq!(state.next_event_id(), EventId::new(2));

        state
            .add_workflow_execution_signaled("go".into(), None, "alice".into())
            .unwrap();
        ops.update_as_active(&mut guard, 1_000).unwrap();

        // Reload from a cold context and observe the committed event.
        drop(guard);
        let cache2 = ExecutionCache::new(Limits::default());
        let context2 = cache2.get_or_create(&key);
        let mut guard2 = context2.lock(&token, &limits).unwrap();
        let reloaded = ops.load(&mut guard2, &namespace_entry()).unwrap();
        assert_eq!(reloaded.next_event_id(), EventId::new(3));
    }

    #[test]
    fn failed_commit_clears_cached_state() {
        let key = WorkflowKey::new(
            NamespaceId::new("ns1").unwrap(),
            WorkflowId::new("wf1").unwrap(),
            RunId::generate(),
        );
        let store = seeded_store(&key);
        let ops = ContextOps {
            execution_store: &store,
            history_store: &store,
            shard_id: ShardId(1),
        };
        let cache = ExecutionCache::new(Limits::default());
        let context = cache.get_or_create(&key);
        let token = CancellationToken::new();
        let limits = Limits::default();

        let mut guard = context.lock(&token, &limits).unwrap();
        let state = ops.load(&mut guard, &namespace_entry()).unwrap();
        state
            .add_workflow_execution_signaled("go".into(), None, "alice".into())
            .unwrap();
        // Sabotage the condition to simulate a lost race.
        state.set_update_condition(999);

        let err = ops.update_as_active(&mut guard, 1_000).unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::ExecutionStore(ExecutionStoreError::ConditionFailed { .. })
        ));
        assert!(guard.cached().is_none(), "failed commit must clear cache");
    }
}
