//! Conflict resolution: rebuild a run's mutable state at a version cut.
//!
//! Divergence unwinds by replaying committed history from the store up to
//! the last cross-confirmed event. The rebuilt state carries the caller's
//! update condition so the eventual commit stays optimistic; nothing is
//! persisted here.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::core::{
    CancellationToken, ClusterName, EventId, HistoryBatch, Limits, ReplicationInfo, RunId,
    Version, WorkflowKey, WorkflowState,
};
use crate::namespace::NamespaceEntry;
use crate::persistence::{ExecutionStoreError, HistoryStore};

use super::error::ReplicationError;
use super::metrics;
use super::mutable_state::MutableState;
use super::state_builder::StateBuilder;

/// What was current before the reset, for the commit fence and the log.
#[derive(Clone, Debug)]
pub struct ResetFence {
    pub prev_run_id: Option<RunId>,
    pub prev_last_write_version: Version,
    pub prev_state: WorkflowState,
}

pub struct ConflictResolver<'a> {
    pub history_store: &'a dyn HistoryStore,
    pub state_builder: &'a StateBuilder,
    pub limits: &'a Limits,
}

impl ConflictResolver<'_> {
    /// Rebuild the run's state by replaying `[1, replay_until]` from its
    /// branch. `prior_replication_info` (the pre-reset per-cluster
    /// watermarks) survives the reset: it records what peers confirmed,
    /// which the divergent tail cannot invalidate.
    pub fn reset(
        &self,
        token: &CancellationToken,
        namespace: &NamespaceEntry,
        key: &WorkflowKey,
        branch_token: &Bytes,
        replay_until: EventId,
        fence: &ResetFence,
        prior_replication_info: BTreeMap<ClusterName, ReplicationInfo>,
        update_condition: i64,
    ) -> Result<MutableState, ReplicationError> {
        tracing::info!(
            target: "repl",
            namespace_id = %key.namespace_id,
            workflow_id = %key.workflow_id,
            run_id = %key.run_id,
            replay_until = %replay_until,
            prev_run_id = ?fence.prev_run_id,
            prev_last_write_version = %fence.prev_last_write_version,
            "resolving conflict by history replay"
        );

        let events = self.read_until(token, branch_token, replay_until)?;
        let batch = HistoryBatch::new(events).map_err(|_| {
            ReplicationError::ExecutionStore(ExecutionStoreError::Internal(format!(
                "no committed history up to event {replay_until} for {key}"
            )))
        })?;

        let start_version = batch.first().version;
        let mut rebuilt = MutableState::new(
            key.namespace_id.clone(),
            key.workflow_id.clone(),
            key.run_id,
            start_version,
            namespace.config.retention_days,
        );
        self.state_builder.replay(&mut rebuilt, &batch)?;
        rebuilt.replace_replication_info(prior_replication_info);
        rebuilt.discard_pending_transaction();
        rebuilt.set_update_condition(update_condition);

        metrics::repl_conflict_resolved();
        tracing::info!(
            target: "repl",
            run_id = %key.run_id,
            next_event_id = %rebuilt.next_event_id(),
            "conflict resolution rebuilt mutable state"
        );
        Ok(rebuilt)
    }

    fn read_until(
        &self,
        token: &CancellationToken,
        branch_token: &Bytes,
        replay_until: EventId,
    ) -> Result<Vec<crate::core::HistoryEvent>, ReplicationError> {
        let max_event_id = replay_until.next();
        let mut events = Vec::new();
        let mut cursor = None;
        loop {
            if token.is_cancelled() {
                return Err(ReplicationError::Cancelled);
            }
            let page = self.history_store.read_history_branch(
                branch_token,
                EventId::FIRST,
                max_event_id,
                self.limits.history_read_page_size,
                cursor,
            )?;
            events.extend(page.events);
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cluster::test_support::two_cluster_metadata;
    use crate::core::{
        EventAttributes, EventType, HistoryEvent, NamespaceId, TaskId, WorkflowId,
    };
    use crate::namespace::{
        NamespaceConfig, NamespaceInfo, NamespaceReplicationConfig,
    };
    use crate::core::ShardId;
    use crate::persistence::MemoryStore;

    fn namespace_entry() -> NamespaceEntry {
        NamespaceEntry {
            info: NamespaceInfo {
                id: NamespaceId::new("ns1").unwrap(),
                name: "ns1-name".into(),
            },
            config: NamespaceConfig { retention_days: 1 },
            replication_config: NamespaceReplicationConfig {
                active_cluster: ClusterName::new("active").unwrap(),
                clusters: vec![ClusterName::new("active").unwrap()],
            },
            failover_version: Version::new(1),
            is_global: true,
        }
    }

    fn event(event_id: i64, version: i64, event_type: EventType) -> HistoryEvent {
        let attributes = match event_type {
            EventType::WorkflowExecutionStarted => EventAttributes::Started(Default::default()),
            _ => EventAttributes::Common,
        };
        HistoryEvent {
            event_id: EventId::new(event_id),
            version: Version::new(version),
            task_id: TaskId(event_id),
            timestamp_ms: 100,
            event_type,
            attributes,
        }
    }

    #[test]
    fn reset_replays_to_cut_and_carries_condition() {
        let store = MemoryStore::new(ShardId(1));
        let branch = Bytes::from_static(b"branch-x");
        let history = vec![
            event(1, 1, EventType::WorkflowExecutionStarted),
            event(2, 1, EventType::DecisionTaskScheduled),
            event(3, 1, EventType::DecisionTaskStarted),
            // diverged tail written under a version peers never confirmed
            event(4, 11, EventType::DecisionTaskCompleted),
            event(5, 11, EventType::ActivityTaskScheduled),
        ];
        store
            .append_history_nodes(&branch, &history, ShardId(1))
            .unwrap();

        let metadata = Arc::new(two_cluster_metadata("active"));
        let state_builder = StateBuilder::new(metadata);
        let limits = Limits::default();
        let resolver = ConflictResolver {
            history_store: &store,
            state_builder: &state_builder,
            limits: &limits,
        };

        let key = WorkflowKey::new(
            NamespaceId::new("ns1").unwrap(),
            WorkflowId::new("wf1").unwrap(),
            RunId::generate(),
        );
        let standby = ClusterName::new("standby").unwrap();
        let mut prior = BTreeMap::new();
        prior.insert(
            standby.clone(),
            ReplicationInfo::new(Version::new(1), EventId::new(3)),
        );
        let fence = ResetFence {
            prev_run_id: Some(key.run_id),
            prev_last_write_version: Version::new(11),
            prev_state: WorkflowState::Running,
        };

        let token = CancellationToken::new();
        let rebuilt = resolver
            .reset(
                &token,
                &namespace_entry(),
                &key,
                &branch,
                EventId::new(3),
                &fence,
                prior,
                1394,
            )
            .unwrap();

        assert_eq!(rebuilt.next_event_id(), EventId::new(4));
        assert_eq!(rebuilt.last_write_version(), Version::new(1));
        assert_eq!(rebuilt.update_condition(), 1394);
        assert!(rebuilt.has_pending_decision(), "in-flight decision survives");
        assert_eq!(
            rebuilt.replication_state().info_for(&standby).unwrap().last_event_id,
            EventId::new(3)
        );
        assert!(!rebuilt.has_pending_changes());
    }

    #[test]
    fn reset_honours_cancellation() {
        let store = MemoryStore::new(ShardId(1));
        let branch = Bytes::from_static(b"branch-y");
        store
            .append_history_nodes(
                &branch,
                &[event(1, 1, EventType::WorkflowExecutionStarted)],
                ShardId(1),
            )
            .unwrap();

        let metadata = Arc::new(two_cluster_metadata("active"));
        let state_builder = StateBuilder::new(metadata);
        let limits = Limits::default();
        let resolver = ConflictResolver {
            history_store: &store,
            state_builder: &state_builder,
            limits: &limits,
        };
        let key = WorkflowKey::new(
            NamespaceId::new("ns1").unwrap(),
            WorkflowId::new("wf1").unwrap(),
            RunId::generate(),
        );
        let fence = ResetFence {
            prev_run_id: None,
            prev_last_write_version: Version::new(1),
            prev_state: WorkflowState::Running,
        };

        let token = CancellationToken::new();
        token.cancel();
        let err = resolver
            .reset(
                &token,
                &namespace_entry(),
                &key,
                &branch,
                EventId::new(1),
                &fence,
                BTreeMap::new(),
                1,
            )
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Cancelled));
    }
}
